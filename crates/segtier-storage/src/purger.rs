//! Archival purge: compress a local segment into the cold tier, then delete it
//!
//! The local copy is removed only after the cold object has been committed.
//! Every failure before that point leaves the segment exactly as it was, so a
//! failed purge can simply be retried; the retry uploads to the same key and
//! replaces whatever partial state the blob store kept.

use crate::blob_store::{BlobStore, Upload};
use crate::compression::GzipStreamEncoder;
use crate::local_log::TrashSegment;
use bytes::Bytes;
use segtier_core::{CoreError, CoreResult, Event, EventSink, SegmentKey, TierConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::Instrument;

const OP: &str = "purge";

/// Outcome of a successful archival purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReceipt {
    /// Cold object key, `<low>-<high>.gz`.
    pub key: String,
    /// Uncompressed bytes read from the local segment.
    pub bytes_read: u64,
    /// Compressed bytes written to the blob store.
    pub bytes_written: u64,
}

/// Step of an upload, used to attribute a failure or a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Open,
    Copy,
    CompressorClose,
    Commit,
}

impl Step {
    fn wrap(self, key: &str, source: CoreError) -> CoreError {
        let key = key.to_string();
        let source = Box::new(source);
        match self {
            Step::Open => CoreError::UploadOpenFailed { key, source },
            Step::Copy => CoreError::CopyFailed { key, source },
            Step::CompressorClose => CoreError::CompressorCloseFailed { key, source },
            Step::Commit => CoreError::CommitFailed { key, source },
        }
    }
}

/// Upload state that must outlive a timed-out transfer.
struct Progress {
    upload: Option<Box<dyn Upload>>,
    step: Step,
    committed: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl Progress {
    fn new() -> Self {
        Self {
            upload: None,
            step: Step::Open,
            committed: false,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    fn fail(&self, key: &str, source: impl Into<CoreError>) -> CoreError {
        self.step.wrap(key, source.into())
    }
}

/// Moves purgeable segments into the cold tier.
///
/// One purger is shared by every segment of a tiered log; concurrent purges
/// of distinct segments are independent.
pub struct ArchivalPurger {
    store: Arc<dyn BlobStore>,
    config: TierConfig,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
}

impl ArchivalPurger {
    pub fn new(store: Arc<dyn BlobStore>, config: TierConfig, sink: Arc<dyn EventSink>) -> Self {
        let timeout = config.upload_timeout();
        Self {
            store,
            config,
            sink,
            timeout,
        }
    }

    /// Override the upload budget taken from the config.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Archive `segment` and, once the cold copy is committed, delete it.
    ///
    /// # Errors
    ///
    /// - `MalformedKey` if the segment name does not encode a range
    /// - `UploadOpenFailed`, `CopyFailed`, `CompressorCloseFailed`,
    ///   `CommitFailed`: the local segment is untouched; a timeout appears as
    ///   the source of whichever step was running
    /// - `LocalPurgeFailed`: the cold copy is committed but the local file
    ///   could not be removed
    pub async fn purge(&self, segment: &dyn TrashSegment) -> CoreResult<ArchiveReceipt> {
        let range = SegmentKey::from_file_name(segment.name())?.range();
        let key = SegmentKey::encode(&range, true);

        let span = tracing::info_span!("purge", key = %key, bucket = %self.config.bucket);
        self.purge_as(segment, &key).instrument(span).await
    }

    async fn purge_as(&self, segment: &dyn TrashSegment, key: &str) -> CoreResult<ArchiveReceipt> {
        let mut progress = Progress::new();

        let timed =
            tokio::time::timeout(self.timeout, self.upload(segment, key, &mut progress)).await;
        let outcome = match timed {
            Ok(result) => result,
            Err(_) => Err(progress.fail(
                key,
                CoreError::Timeout {
                    op: OP,
                    secs: self.timeout.as_secs(),
                },
            )),
        };

        if !progress.committed {
            self.abort_uncommitted(key, &mut progress).await;
        }

        if let Err(e) = outcome {
            self.sink
                .report_event(Event::error(OP, key, &e, "Upload failed"));
            return Err(e);
        }

        self.sink.report_event(Event::debug(
            OP,
            key,
            format!(
                "Uploaded {} bytes ({} compressed)",
                progress.bytes_read, progress.bytes_written
            ),
        ));

        segment
            .purge()
            .await
            .map_err(|e| CoreError::LocalPurgeFailed {
                key: key.to_string(),
                source: Box::new(e),
            })?;

        tracing::info!(
            bytes_read = progress.bytes_read,
            bytes_written = progress.bytes_written,
            "Segment archived"
        );
        Ok(ArchiveReceipt {
            key: key.to_string(),
            bytes_read: progress.bytes_read,
            bytes_written: progress.bytes_written,
        })
    }

    /// Open, stream and commit. Leaves the open upload in `progress` so the
    /// caller can abort it whatever happened here.
    async fn upload(
        &self,
        segment: &dyn TrashSegment,
        key: &str,
        progress: &mut Progress,
    ) -> CoreResult<()> {
        let upload = self
            .store
            .upload_object(&self.config.bucket, key)
            .await
            .map_err(|e| progress.fail(key, e))?;
        let upload = progress.upload.insert(upload);

        progress.step = Step::Copy;
        let mut reader = segment.open().await.map_err(|e| progress.step.wrap(key, e))?;
        let mut encoder = GzipStreamEncoder::new(self.config.compression_level);
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| progress.step.wrap(key, e.into()))?;
            if n == 0 {
                break;
            }
            progress.bytes_read += n as u64;

            let compressed = encoder
                .compress(&buf[..n])
                .map_err(|e| progress.step.wrap(key, e.into()))?;
            write_chunk(&mut **upload, compressed, &mut progress.bytes_written)
                .await
                .map_err(|e| progress.step.wrap(key, e))?;
        }

        progress.step = Step::CompressorClose;
        let trailer = encoder
            .finish()
            .map_err(|e| progress.step.wrap(key, e.into()))?;
        write_chunk(&mut **upload, trailer, &mut progress.bytes_written)
            .await
            .map_err(|e| progress.step.wrap(key, e))?;

        progress.step = Step::Commit;
        upload
            .commit()
            .await
            .map_err(|e| progress.step.wrap(key, e))?;
        progress.committed = true;
        Ok(())
    }

    /// Best-effort cleanup; never changes the purge outcome.
    async fn abort_uncommitted(&self, key: &str, progress: &mut Progress) {
        let Some(upload) = progress.upload.as_mut() else {
            return;
        };

        match tokio::time::timeout(self.timeout, upload.abort()).await {
            Ok(Ok(())) => {
                self.sink
                    .report_event(Event::info(OP, key, "Upload aborted"));
            }
            Ok(Err(e)) if e.is_already_finished() => {
                self.sink
                    .report_event(Event::debug(OP, key, "Upload already aborted/committed"));
            }
            Ok(Err(e)) => {
                self.sink
                    .report_event(Event::error(OP, key, &e, "Could not abort upload"));
            }
            Err(_) => {
                let e = CoreError::Timeout {
                    op: "abort",
                    secs: self.timeout.as_secs(),
                };
                self.sink
                    .report_event(Event::error(OP, key, &e, "Could not abort upload"));
            }
        }
    }
}

async fn write_chunk(upload: &mut dyn Upload, chunk: Bytes, written: &mut u64) -> CoreResult<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    let len = chunk.len() as u64;
    upload.write(chunk).await?;
    *written += len;
    Ok(())
}
