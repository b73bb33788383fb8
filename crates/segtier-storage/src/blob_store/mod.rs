//! Blob store abstraction for the cold tier
//!
//! The archival path needs streamed uploads that only become visible once
//! committed, the read path needs streamed downloads and a bucket listing.
//! Backends:
//! - Local filesystem (development, single-node deployments)
//! - In-memory mock with fault injection (testing)
//! - AWS S3 / MinIO (production)

mod local;
mod mock;
mod s3;

pub use local::LocalBlobStore;
pub use mock::{CallHistoryEntry, MockBlobStore, MockFailure, MockOp};
pub use s3::{S3BlobStore, S3Config, S3Endpoint};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use segtier_core::CoreResult;
use serde::{Deserialize, Serialize};

/// Chunked body of a downloaded object.
pub type ByteStream = BoxStream<'static, CoreResult<Bytes>>;

/// Object metadata returned by listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object key within its bucket
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last modification timestamp
    pub last_modified: DateTime<Utc>,
}

/// An in-progress upload.
///
/// Written bytes are invisible to readers until [`Upload::commit`] succeeds.
/// Once committed or aborted, both `commit` and `abort` fail with
/// `CoreError::AlreadyFinished`.
#[async_trait]
pub trait Upload: Send {
    /// Key this upload will be committed under.
    fn key(&self) -> &str;

    /// Appends a chunk to the upload.
    async fn write(&mut self, chunk: Bytes) -> CoreResult<()>;

    /// Makes the written bytes durable and visible under the key.
    async fn commit(&mut self) -> CoreResult<()>;

    /// Discards the written bytes.
    async fn abort(&mut self) -> CoreResult<()>;
}

/// Bucket-scoped remote object storage
///
/// All implementations must be thread-safe (Send + Sync); one session is
/// shared by concurrent archival and retrieval operations.
///
/// # Error Handling
///
/// - `CoreError::NotFound` - bucket or object does not exist
/// - `CoreError::StorageError` - backend-specific error (network, permissions, etc.)
/// - `CoreError::IoError` - I/O error (local filesystem only)
/// - `CoreError::AlreadyFinished` - commit/abort on a finished upload
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates the bucket unless it already exists.
    async fn ensure_bucket(&self, bucket: &str) -> CoreResult<()>;

    /// Starts an upload to `key`; an existing object is replaced on commit.
    async fn upload_object(&self, bucket: &str, key: &str) -> CoreResult<Box<dyn Upload>>;

    /// Opens a committed object for streaming.
    async fn download_object(&self, bucket: &str, key: &str) -> CoreResult<ByteStream>;

    /// Lists every committed object in the bucket.
    ///
    /// No ordering is guaranteed.
    async fn list_objects(&self, bucket: &str) -> CoreResult<Vec<ObjectInfo>>;

    /// Releases the session.
    async fn close(&self) -> CoreResult<()>;
}

/// Rejects keys that cannot be stored as a flat object name.
pub(crate) fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(segtier_core::CoreError::ValidationError(
            "Key cannot be empty".to_string(),
        ));
    }
    if key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(segtier_core::CoreError::ValidationError(format!(
            "Key `{key}` must be a flat name not starting with '.'"
        )));
    }
    Ok(())
}

/// Bucket names share the key restrictions.
pub(crate) fn validate_bucket(bucket: &str) -> CoreResult<()> {
    validate_key(bucket)
}
