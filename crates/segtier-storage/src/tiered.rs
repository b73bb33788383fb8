//! Tiered log: a local segment store whose purges go through cold storage
//!
//! `TieredLog` holds the local store and forwards purge discovery to it, but
//! hands back segments whose `purge()` archives before deleting. Everything
//! else about the local store is left to its owner.

use crate::blob_store::BlobStore;
use crate::local_log::{LogStore, SegmentReader, TrashSegment};
use crate::purger::{ArchivalPurger, ArchiveReceipt};
use crate::reader::{ColdRangeReader, RangeStream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use segtier_core::{CoreError, CoreResult, EventSink, QueryRange, TierConfig};
use serde::Serialize;
use std::sync::Arc;

/// Per-segment outcome of [`TieredLog::archive_purgeable`].
#[derive(Debug, Default)]
pub struct ArchiveReport {
    pub archived: Vec<ArchiveReceipt>,
    /// Segment name and the error that stopped it.
    pub failed: Vec<(String, CoreError)>,
}

impl ArchiveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> ArchiveSummary {
        ArchiveSummary {
            archived: self.archived.len(),
            failed: self.failed.len(),
            bytes_read: self.archived.iter().map(|r| r.bytes_read).sum(),
            bytes_written: self.archived.iter().map(|r| r.bytes_written).sum(),
        }
    }
}

/// Totals of an archive run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub archived: usize,
    pub failed: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Local log store with a cold tier behind it.
pub struct TieredLog {
    local: Arc<dyn LogStore>,
    store: Arc<dyn BlobStore>,
    purger: Arc<ArchivalPurger>,
    reader: ColdRangeReader,
}

impl TieredLog {
    /// Wrap `local`, ensuring the cold bucket exists.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::BucketEnsureFailed` if the bucket cannot be
    /// created; no tiered log is produced in that case.
    pub async fn new(
        local: Arc<dyn LogStore>,
        store: Arc<dyn BlobStore>,
        config: TierConfig,
        sink: Arc<dyn EventSink>,
    ) -> CoreResult<Self> {
        store
            .ensure_bucket(&config.bucket)
            .await
            .map_err(|e| CoreError::BucketEnsureFailed {
                bucket: config.bucket.clone(),
                source: Box::new(e),
            })?;

        tracing::info!(bucket = %config.bucket, "Cold tier ready");

        let purger = ArchivalPurger::new(store.clone(), config.clone(), sink.clone());
        let reader = ColdRangeReader::new(store.clone(), config, sink);
        Ok(Self {
            local,
            store,
            purger: Arc::new(purger),
            reader,
        })
    }

    /// Purgeable segments of the local store, each purging through the cold
    /// tier. Errors from the local store are returned unchanged.
    pub async fn purgeable(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Box<dyn TrashSegment>>> {
        let segments = self.local.purgeable(cutoff).await?;
        Ok(segments
            .into_iter()
            .map(|inner| {
                Box::new(ArchivedTrashSegment {
                    inner,
                    purger: self.purger.clone(),
                }) as Box<dyn TrashSegment>
            })
            .collect())
    }

    /// Archive every purgeable segment, continuing past failures.
    pub async fn archive_purgeable(&self, cutoff: DateTime<Utc>) -> CoreResult<ArchiveReport> {
        let mut report = ArchiveReport::default();

        for segment in self.local.purgeable(cutoff).await? {
            match self.purger.purge(segment.as_ref()).await {
                Ok(receipt) => report.archived.push(receipt),
                Err(e) => {
                    tracing::warn!(segment = %segment.name(), error = %e, "Archival failed");
                    report.failed.push((segment.name().to_string(), e));
                }
            }
        }

        Ok(report)
    }

    /// Stream archived content overlapping `query`.
    pub fn open_range(&self, query: QueryRange) -> RangeStream {
        self.reader.open_range(query)
    }

    pub fn purger(&self) -> &ArchivalPurger {
        &self.purger
    }

    /// Release the blob-store session. The local store stays open.
    pub async fn close(&self) -> CoreResult<()> {
        self.store.close().await
    }
}

#[async_trait]
impl LogStore for TieredLog {
    async fn purgeable(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Box<dyn TrashSegment>>> {
        TieredLog::purgeable(self, cutoff).await
    }
}

/// Local segment whose purge archives it first.
pub struct ArchivedTrashSegment {
    inner: Box<dyn TrashSegment>,
    purger: Arc<ArchivalPurger>,
}

impl ArchivedTrashSegment {
    /// Archive and delete, returning what was uploaded.
    pub async fn archive(&self) -> CoreResult<ArchiveReceipt> {
        self.purger.purge(self.inner.as_ref()).await
    }
}

#[async_trait]
impl TrashSegment for ArchivedTrashSegment {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn open(&self) -> CoreResult<SegmentReader> {
        self.inner.open().await
    }

    async fn purge(&self) -> CoreResult<()> {
        self.archive().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{MockBlobStore, MockFailure, MockOp};
    use crate::local_log::FileLogStore;
    use chrono::Duration;
    use segtier_core::{MemoryEventSink, SegmentId, SegmentKey, SegmentRange};
    use tempfile::TempDir;

    struct FailingLogStore;

    #[async_trait]
    impl LogStore for FailingLogStore {
        async fn purgeable(&self, _cutoff: DateTime<Utc>) -> CoreResult<Vec<Box<dyn TrashSegment>>> {
            Err(CoreError::StorageError("disk unavailable".to_string()))
        }
    }

    fn range(low_ms: u64, high_ms: u64) -> SegmentRange {
        SegmentRange::new(
            SegmentId::from_parts(low_ms, 0),
            SegmentId::from_parts(high_ms, 0),
        )
        .unwrap()
    }

    async fn tiered(local: Arc<dyn LogStore>, mock: &MockBlobStore) -> CoreResult<TieredLog> {
        TieredLog::new(
            local,
            Arc::new(mock.clone()),
            TierConfig::default().with_bucket("cold"),
            Arc::new(MemoryEventSink::new()),
        )
        .await
    }

    #[tokio::test]
    async fn test_new_ensures_bucket() {
        let mock = MockBlobStore::new();
        tiered(Arc::new(FailingLogStore), &mock).await.unwrap();
        assert!(mock.has_bucket("cold"));
    }

    #[tokio::test]
    async fn test_new_fails_when_bucket_cannot_be_ensured() {
        let mock = MockBlobStore::new();
        mock.fail_next(MockOp::EnsureBucket, MockFailure::Permanent("403 Forbidden"));

        let err = tiered(Arc::new(FailingLogStore), &mock).await.err().unwrap();
        assert!(matches!(err, CoreError::BucketEnsureFailed { ref bucket, .. } if bucket == "cold"));
    }

    #[tokio::test]
    async fn test_purgeable_propagates_local_error() {
        let mock = MockBlobStore::new();
        let log = tiered(Arc::new(FailingLogStore), &mock).await.unwrap();

        assert!(matches!(
            log.purgeable(Utc::now()).await,
            Err(CoreError::StorageError(ref msg)) if msg == "disk unavailable"
        ));
    }

    #[tokio::test]
    async fn test_wrapped_purge_archives() {
        let dir = TempDir::new().unwrap();
        let local = FileLogStore::new(dir.path()).await.unwrap();
        let path = local.seal(&range(1, 2), b"payload").await.unwrap();
        let mock = MockBlobStore::new();
        let log = tiered(Arc::new(local), &mock).await.unwrap();

        let segments = log.purgeable(Utc::now() + Duration::minutes(1)).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(
            segments[0].name(),
            path.file_name().unwrap().to_str().unwrap()
        );

        segments[0].purge().await.unwrap();
        assert!(!path.exists());
        assert!(mock.contains_object("cold", &SegmentKey::encode(&range(1, 2), true)));
    }

    #[tokio::test]
    async fn test_close_only_closes_blob_store() {
        let dir = TempDir::new().unwrap();
        let local = FileLogStore::new(dir.path()).await.unwrap();
        local.seal(&range(1, 2), b"payload").await.unwrap();
        let local: Arc<dyn LogStore> = Arc::new(local);
        let mock = MockBlobStore::new();
        let log = tiered(local.clone(), &mock).await.unwrap();

        log.close().await.unwrap();
        assert!(mock.is_closed());
        // The local store remains usable by its owner
        let future = Utc::now() + Duration::minutes(1);
        assert_eq!(local.purgeable(future).await.unwrap().len(), 1);
    }
}
