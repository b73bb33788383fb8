//! Record prefix handling for retrieved content
//!
//! Archived records are lines of the form `<ULID> <payload>`. By default the
//! id is stripped; it can be kept as stored or replaced by its timestamp.
//! Lines that do not start with an id are passed through unchanged.

use chrono::SecondsFormat;
use clap::ValueEnum;
use segtier_core::SegmentId;
use std::borrow::Cow;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

const ID_LEN: usize = 26;

/// What to put in front of each retrieved record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RecordPrefix {
    /// Payload only
    #[default]
    None,
    /// The record id, as stored
    Ulid,
    /// The record's RFC 3339 timestamp
    Time,
}

impl RecordPrefix {
    /// Rewrite one record line.
    pub fn rewrite(self, line: &[u8]) -> Cow<'_, [u8]> {
        let Some((id, payload)) = split_record(line) else {
            return Cow::Borrowed(line);
        };
        match self {
            Self::Ulid => Cow::Borrowed(line),
            Self::None => Cow::Borrowed(payload),
            Self::Time => {
                let stamp = id.datetime().to_rfc3339_opts(SecondsFormat::Millis, true);
                let mut out = Vec::with_capacity(stamp.len() + 1 + payload.len());
                out.extend_from_slice(stamp.as_bytes());
                out.push(b' ');
                out.extend_from_slice(payload);
                Cow::Owned(out)
            }
        }
    }
}

fn split_record(line: &[u8]) -> Option<(SegmentId, &[u8])> {
    if line.len() <= ID_LEN || line[ID_LEN] != b' ' {
        return None;
    }
    let id = std::str::from_utf8(&line[..ID_LEN]).ok()?.parse().ok()?;
    Some((id, &line[ID_LEN + 1..]))
}

/// Copy records from `reader` to `writer`, rewriting each line's prefix.
/// Returns the number of bytes written.
pub async fn copy_records<R, W>(reader: R, writer: &mut W, prefix: RecordPrefix) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    if prefix == RecordPrefix::Ulid {
        return tokio::io::copy_buf(&mut reader, writer).await;
    }

    let mut line = Vec::new();
    let mut written = 0u64;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let out = prefix.rewrite(&line);
        writer.write_all(&out).await?;
        written += out.len() as u64;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &[u8] = b"01F5YA5BHRMSAGN154K4000000 hello world\n";

    #[test]
    fn test_default_strips_id() {
        assert_eq!(&*RecordPrefix::None.rewrite(RECORD), b"hello world\n");
    }

    #[test]
    fn test_ulid_keeps_line() {
        assert_eq!(&*RecordPrefix::Ulid.rewrite(RECORD), RECORD);
    }

    #[test]
    fn test_time_replaces_id_with_timestamp() {
        let out = RecordPrefix::Time.rewrite(RECORD);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("2021-05-17T23:21:46."));
        assert!(text.ends_with("Z hello world\n"));
    }

    #[test]
    fn test_lines_without_id_pass_through() {
        for line in [&b"plain text\n"[..], b"", b"01F5YA5BHRMSAGN154K4000000\n", b"not-an-id-but-26-chars-lng payload\n"] {
            assert_eq!(&*RecordPrefix::None.rewrite(line), line);
        }
    }

    #[tokio::test]
    async fn test_copy_records_handles_every_line() {
        let input = [RECORD, b"01F5YC8JST5JKMJXBB9R000000 second"].concat();
        let mut out = Vec::new();

        let written = copy_records(&input[..], &mut out, RecordPrefix::None).await.unwrap();
        assert_eq!(out, b"hello world\nsecond");
        assert_eq!(written, out.len() as u64);

        let mut raw = Vec::new();
        copy_records(&input[..], &mut raw, RecordPrefix::Ulid).await.unwrap();
        assert_eq!(raw, input);
    }
}
