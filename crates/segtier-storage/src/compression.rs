//! Incremental gzip for cold-storage objects
//!
//! Both directions work chunk by chunk over an in-memory sink that is drained
//! after every step, so a segment never has to be held in memory whole.

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::{self, Write};

/// Convert a 0-9 level to `flate2::Compression`
pub fn compression_level(level: u32) -> Compression {
    match level {
        0 => Compression::none(),
        1 => Compression::fast(),
        6 => Compression::default(),
        9 => Compression::best(),
        n => Compression::new(n.min(9)),
    }
}

/// Streaming gzip compressor.
pub struct GzipStreamEncoder {
    inner: GzEncoder<Vec<u8>>,
    bytes_in: u64,
    bytes_out: u64,
}

impl GzipStreamEncoder {
    pub fn new(level: u32) -> Self {
        Self {
            inner: GzEncoder::new(Vec::new(), compression_level(level)),
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Feed plain bytes, returning whatever compressed output is ready.
    ///
    /// The result is often empty; deflate emits output in blocks.
    pub fn compress(&mut self, input: &[u8]) -> io::Result<Bytes> {
        self.inner.write_all(input)?;
        self.bytes_in += input.len() as u64;
        Ok(self.drain())
    }

    /// Flush the remaining deflate state and write the gzip trailer.
    pub fn finish(mut self) -> io::Result<Bytes> {
        self.inner.try_finish()?;
        Ok(self.drain())
    }

    /// Plain bytes consumed so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Compressed bytes produced so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    fn drain(&mut self) -> Bytes {
        let out = std::mem::take(self.inner.get_mut());
        self.bytes_out += out.len() as u64;
        Bytes::from(out)
    }
}

/// Streaming gzip decompressor.
///
/// Malformed input (bad magic, corrupt deflate data, CRC mismatch) surfaces
/// as an `io::Error` from [`GzipStreamDecoder::decompress`] or
/// [`GzipStreamDecoder::finish`].
pub struct GzipStreamDecoder {
    inner: GzDecoder<Vec<u8>>,
}

impl GzipStreamDecoder {
    pub fn new() -> Self {
        Self {
            inner: GzDecoder::new(Vec::new()),
        }
    }

    /// Feed compressed bytes, returning whatever plain output is ready.
    pub fn decompress(&mut self, input: &[u8]) -> io::Result<Bytes> {
        self.inner.write_all(input)?;
        Ok(Bytes::from(std::mem::take(self.inner.get_mut())))
    }

    /// Check the stream ended cleanly and return the last plain bytes.
    pub fn finish(mut self) -> io::Result<Bytes> {
        self.inner.try_finish()?;
        let tail = std::mem::take(self.inner.get_mut());
        // Header not yet complete: the object was truncated or empty.
        if self.inner.header().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "gzip stream ended before its header",
            ));
        }
        Ok(Bytes::from(tail))
    }
}

impl Default for GzipStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
