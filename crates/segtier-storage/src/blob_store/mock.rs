//! Mock BlobStore for testing
//!
//! In-memory buckets with per-operation fault injection, so the archival and
//! retrieval paths can be driven through every failure branch without a real
//! object store.
//!
//! # Features
//!
//! - **Deterministic Failures**: queue failures per operation
//! - **Broken Bodies**: cut a download stream short with an error
//! - **Stalls**: delay an operation past a caller's timeout
//! - **Raw Objects**: plant arbitrary (e.g. corrupted) bytes under a key
//! - **Call History**: track all operations for assertions
//!
//! # Examples
//!
//! ```rust
//! use segtier_storage::blob_store::{BlobStore, MockBlobStore, MockFailure, MockOp};
//! use bytes::Bytes;
//!
//! # async fn example() -> segtier_core::CoreResult<()> {
//! let mock = MockBlobStore::new();
//! mock.ensure_bucket("cold").await?;
//! mock.fail_next(MockOp::Commit, MockFailure::Transient("503 Service Unavailable"));
//!
//! let mut upload = mock.upload_object("cold", "key").await?;
//! upload.write(Bytes::from("data")).await?;
//! assert!(upload.commit().await.is_err());
//! assert!(!mock.contains_object("cold", "key"));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{BlobStore, ByteStream, ObjectInfo, Upload};
use segtier_core::{CoreError, CoreResult};

/// Size of the chunks a mock download yields.
const DOWNLOAD_CHUNK_SIZE: usize = 1024;

/// Operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    EnsureBucket,
    UploadOpen,
    Write,
    Commit,
    Abort,
    Download,
    List,
    Close,
}

/// Mock failure pattern.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Transient error. Examples: 500, 503, 504, timeout.
    Transient(&'static str),

    /// Permanent error. Examples: 403, 404, 400.
    Permanent(&'static str),

    /// Commit reports failure but the upload is left finished, as when a
    /// backend finalises the object and then loses the response.
    CommitLost(&'static str),

    /// Success (no error).
    Ok,
}

impl MockFailure {
    fn to_error(&self) -> Option<CoreError> {
        match self {
            MockFailure::Transient(msg) => {
                Some(CoreError::StorageError(format!("Transient: {}", msg)))
            }
            MockFailure::Permanent(msg) => {
                Some(CoreError::StorageError(format!("Permanent: {}", msg)))
            }
            MockFailure::CommitLost(msg) => {
                Some(CoreError::StorageError(format!("Lost: {}", msg)))
            }
            MockFailure::Ok => None,
        }
    }
}

/// Mock call history entry.
#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    pub op: MockOp,

    /// Bucket or object key the call addressed.
    pub target: String,

    /// Whether operation succeeded.
    pub success: bool,

    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    seq: u64,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    next_seq: u64,
    failures: HashMap<MockOp, VecDeque<MockFailure>>,
    failing_downloads: HashSet<String>,
    broken_bodies: HashMap<String, usize>,
    stalls: HashMap<MockOp, Duration>,
    history: Vec<CallHistoryEntry>,
    closed: bool,
}

/// In-memory BlobStore with configurable failures.
///
/// Listings are returned in commit order, which lets tests observe the
/// difference between sorted and as-listed range reads.
#[derive(Clone, Default)]
pub struct MockBlobStore {
    state: Arc<RwLock<MockState>>,
}

impl MockBlobStore {
    /// Create new mock with no failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next call of `op`.
    ///
    /// Failures are consumed in order; once the queue is empty, calls succeed.
    pub fn fail_next(&self, op: MockOp, failure: MockFailure) {
        self.state
            .write()
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Make every call of `op` fail.
    ///
    /// Pre-fills the queue with 1000 identical failures.
    pub fn fail_always(&self, op: MockOp, failure: MockFailure) {
        let mut state = self.state.write();
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat(failure).take(1000));
    }

    /// Make every download of `key` fail.
    pub fn fail_download_of(&self, key: impl Into<String>) {
        self.state.write().failing_downloads.insert(key.into());
    }

    /// Open downloads of `key` normally, but end the body with an error
    /// after `after_chunks` chunks.
    pub fn fail_download_body_of(&self, key: impl Into<String>, after_chunks: usize) {
        self.state
            .write()
            .broken_bodies
            .insert(key.into(), after_chunks);
    }

    /// Delay every call of `op` by `delay`.
    pub fn stall(&self, op: MockOp, delay: Duration) {
        self.state.write().stalls.insert(op, delay);
    }

    /// Store raw bytes under a key, bypassing the upload protocol.
    pub fn put_raw(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state.write();
        insert_object(&mut state, bucket, key, data.into());
    }

    /// Raw bytes stored under a key.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .read()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
    }

    pub fn contains_object(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state.read().buckets.contains_key(bucket)
    }

    /// Number of objects in a bucket.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.state
            .read()
            .buckets
            .get(bucket)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Get call history for assertions.
    pub fn get_call_history(&self) -> Vec<CallHistoryEntry> {
        self.state.read().history.clone()
    }

    /// Count calls of `op` with the given outcome.
    pub fn count_calls(&self, op: MockOp, success: bool) -> usize {
        self.state
            .read()
            .history
            .iter()
            .filter(|entry| entry.op == op && entry.success == success)
            .count()
    }

    /// Reset storage, failures and history.
    pub fn reset(&self) {
        *self.state.write() = MockState::default();
    }

    /// Sleep for any configured stall, then pop the next queued failure.
    async fn enter(&self, op: MockOp, target: &str) -> CoreResult<Option<MockFailure>> {
        let stall = self.state.read().stalls.get(&op).copied();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write();
        let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
        match failure.as_ref().and_then(MockFailure::to_error) {
            Some(error) if !matches!(failure, Some(MockFailure::CommitLost(_))) => {
                record(&mut state, op, target, false);
                Err(error)
            }
            _ => Ok(failure),
        }
    }

    fn record(&self, op: MockOp, target: &str, success: bool) {
        record(&mut self.state.write(), op, target, success);
    }
}

fn record(state: &mut MockState, op: MockOp, target: &str, success: bool) {
    state.history.push(CallHistoryEntry {
        op,
        target: target.to_string(),
        success,
        timestamp: Instant::now(),
    });
}

fn insert_object(state: &mut MockState, bucket: &str, key: &str, data: Bytes) {
    let seq = state.next_seq;
    state.next_seq += 1;
    state.buckets.entry(bucket.to_string()).or_default().insert(
        key.to_string(),
        StoredObject {
            data,
            seq,
            last_modified: Utc::now(),
        },
    );
}

fn missing_bucket(bucket: &str) -> CoreError {
    CoreError::not_found("bucket", bucket)
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> CoreResult<()> {
        self.enter(MockOp::EnsureBucket, bucket).await?;
        let mut state = self.state.write();
        state.buckets.entry(bucket.to_string()).or_default();
        record(&mut state, MockOp::EnsureBucket, bucket, true);
        Ok(())
    }

    async fn upload_object(&self, bucket: &str, key: &str) -> CoreResult<Box<dyn Upload>> {
        self.enter(MockOp::UploadOpen, key).await?;
        if !self.has_bucket(bucket) {
            self.record(MockOp::UploadOpen, key, false);
            return Err(missing_bucket(bucket));
        }
        self.record(MockOp::UploadOpen, key, true);

        Ok(Box::new(MockUpload {
            store: self.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            buffer: Vec::new(),
            finished: false,
        }))
    }

    async fn download_object(&self, bucket: &str, key: &str) -> CoreResult<ByteStream> {
        self.enter(MockOp::Download, key).await?;

        let (data, broken_after) = {
            let state = self.state.read();
            let broken_after = state.broken_bodies.get(key).copied();
            if state.failing_downloads.contains(key) {
                (None, broken_after)
            } else {
                let data = state
                    .buckets
                    .get(bucket)
                    .ok_or_else(|| missing_bucket(bucket))?
                    .get(key)
                    .map(|object| object.data.clone())
                    .ok_or_else(|| CoreError::not_found("object", key))?;
                (Some(data), broken_after)
            }
        };

        let Some(data) = data else {
            self.record(MockOp::Download, key, false);
            return Err(CoreError::StorageError(format!(
                "Permanent: download of {key} refused"
            )));
        };
        self.record(MockOp::Download, key, true);

        let mut chunks: Vec<CoreResult<Bytes>> = data
            .chunks(DOWNLOAD_CHUNK_SIZE)
            .map(|chunk| Ok(data.slice_ref(chunk)))
            .collect();
        if let Some(after) = broken_after {
            chunks.truncate(after);
            chunks.push(Err(CoreError::StorageError(format!(
                "Transient: connection reset reading {key}"
            ))));
        }
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn list_objects(&self, bucket: &str) -> CoreResult<Vec<ObjectInfo>> {
        self.enter(MockOp::List, bucket).await?;

        let state = self.state.read();
        let objects = state.buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;

        let mut listed: Vec<(u64, ObjectInfo)> = objects
            .iter()
            .map(|(key, object)| {
                (
                    object.seq,
                    ObjectInfo {
                        key: key.clone(),
                        size_bytes: object.data.len() as u64,
                        last_modified: object.last_modified,
                    },
                )
            })
            .collect();
        listed.sort_by_key(|(seq, _)| *seq);

        Ok(listed.into_iter().map(|(_, info)| info).collect())
    }

    async fn close(&self) -> CoreResult<()> {
        self.enter(MockOp::Close, "").await?;
        self.state.write().closed = true;
        self.record(MockOp::Close, "", true);
        Ok(())
    }
}

struct MockUpload {
    store: MockBlobStore,
    bucket: String,
    key: String,
    buffer: Vec<u8>,
    finished: bool,
}

#[async_trait]
impl Upload for MockUpload {
    fn key(&self) -> &str {
        &self.key
    }

    async fn write(&mut self, chunk: Bytes) -> CoreResult<()> {
        self.store.enter(MockOp::Write, &self.key).await?;
        if self.finished {
            return Err(CoreError::already_finished(&self.key));
        }
        self.buffer.extend_from_slice(&chunk);
        self.store.record(MockOp::Write, &self.key, true);
        Ok(())
    }

    async fn commit(&mut self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::already_finished(&self.key));
        }

        if let Some(MockFailure::CommitLost(msg)) = self.store.enter(MockOp::Commit, &self.key).await? {
            self.finished = true;
            self.store.record(MockOp::Commit, &self.key, false);
            return Err(CoreError::StorageError(format!("Lost: {msg}")));
        }

        let data = Bytes::from(std::mem::take(&mut self.buffer));
        let mut state = self.store.state.write();
        insert_object(&mut state, &self.bucket, &self.key, data);
        record(&mut state, MockOp::Commit, &self.key, true);
        self.finished = true;
        Ok(())
    }

    async fn abort(&mut self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::already_finished(&self.key));
        }
        self.store.enter(MockOp::Abort, &self.key).await?;
        self.finished = true;
        self.buffer.clear();
        self.store.record(MockOp::Abort, &self.key, true);
        Ok(())
    }
}

impl std::fmt::Debug for MockBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MockBlobStore")
            .field("buckets", &state.buckets.keys().collect::<Vec<_>>())
            .field("calls", &state.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn download(mock: &MockBlobStore, key: &str) -> Vec<u8> {
        let chunks: Vec<Bytes> = mock
            .download_object("cold", key)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_mock_upload_round_trip() {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();

        let mut upload = mock.upload_object("cold", "key").await.unwrap();
        upload.write(Bytes::from("part1")).await.unwrap();
        assert!(!mock.contains_object("cold", "key"));
        upload.write(Bytes::from("part2")).await.unwrap();
        upload.commit().await.unwrap();

        assert_eq!(download(&mock, "key").await, b"part1part2");
        assert!(upload.abort().await.unwrap_err().is_already_finished());
    }

    #[tokio::test]
    async fn test_mock_deterministic_failures() {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();
        mock.fail_next(MockOp::UploadOpen, MockFailure::Transient("500 Internal Server Error"));
        mock.fail_next(MockOp::UploadOpen, MockFailure::Permanent("403 Forbidden"));

        let first = mock.upload_object("cold", "k").await.err().unwrap();
        assert!(first.to_string().contains("500"));
        let second = mock.upload_object("cold", "k").await.err().unwrap();
        assert!(second.to_string().contains("403"));
        assert!(mock.upload_object("cold", "k").await.is_ok());

        assert_eq!(mock.count_calls(MockOp::UploadOpen, false), 2);
        assert_eq!(mock.count_calls(MockOp::UploadOpen, true), 1);
    }

    #[tokio::test]
    async fn test_mock_commit_lost_finishes_upload() {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();
        mock.fail_next(MockOp::Commit, MockFailure::CommitLost("connection reset"));

        let mut upload = mock.upload_object("cold", "k").await.unwrap();
        assert!(upload.commit().await.is_err());
        assert!(upload.abort().await.unwrap_err().is_already_finished());
        assert!(!mock.contains_object("cold", "k"));
    }

    #[tokio::test]
    async fn test_mock_list_in_commit_order() {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();
        mock.put_raw("cold", "b", "2");
        mock.put_raw("cold", "a", "1");
        mock.put_raw("cold", "c", "3");

        let keys: Vec<String> = mock
            .list_objects("cold")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_mock_download_faults() {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();
        mock.put_raw("cold", "k", "data");
        mock.fail_download_of("k");

        assert!(mock.download_object("cold", "k").await.is_err());
        assert!(matches!(
            mock.download_object("cold", "missing").await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            mock.list_objects("nope").await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_broken_body_errors_mid_stream() {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();
        mock.put_raw("cold", "k", vec![1u8; DOWNLOAD_CHUNK_SIZE * 3]);
        mock.fail_download_body_of("k", 1);

        let mut stream = mock.download_object("cold", "k").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), DOWNLOAD_CHUNK_SIZE);
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_large_download_is_chunked() {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();
        let data = vec![7u8; DOWNLOAD_CHUNK_SIZE * 2 + 1];
        mock.put_raw("cold", "k", data.clone());

        let chunks: Vec<Bytes> = mock
            .download_object("cold", "k")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data);
    }
}
