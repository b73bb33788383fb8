//! Local filesystem implementation of BlobStore
//!
//! Buckets are directories under a root directory and objects are files
//! within them. An upload streams into a hidden `.partial` file next to its
//! destination and is renamed into place on commit, so readers never observe
//! a half-written object.

use super::{validate_bucket, validate_key, BlobStore, ByteStream, ObjectInfo, Upload};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use segtier_core::{CoreError, CoreResult};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
const PARTIAL_SUFFIX: &str = ".partial";

/// Local filesystem blob store
///
/// # Example
///
/// ```rust,no_run
/// use segtier_storage::blob_store::{BlobStore, LocalBlobStore};
///
/// #[tokio::main]
/// async fn main() -> segtier_core::CoreResult<()> {
///     let store = LocalBlobStore::new("./cold").await?;
///     store.ensure_bucket("segments").await?;
///
///     for object in store.list_objects("segments").await? {
///         println!("{} ({} bytes)", object.key, object.size_bytes);
///     }
///     Ok(())
/// }
/// ```
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a new local blob store, creating `root` if needed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::IoError` if directory creation fails
    pub async fn new(root: impl AsRef<Path>) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    async fn existing_bucket_dir(&self, bucket: &str) -> CoreResult<PathBuf> {
        validate_bucket(bucket)?;
        let dir = self.bucket_dir(bucket);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(CoreError::not_found("bucket", bucket));
        }
        Ok(dir)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> CoreResult<()> {
        validate_bucket(bucket)?;
        tokio::fs::create_dir_all(self.bucket_dir(bucket)).await?;
        Ok(())
    }

    async fn upload_object(&self, bucket: &str, key: &str) -> CoreResult<Box<dyn Upload>> {
        validate_key(key)?;
        let dir = self.existing_bucket_dir(bucket).await?;

        let nonce: u64 = rand::thread_rng().gen();
        let temp_path = dir.join(format!(".{key}.{nonce:016x}{PARTIAL_SUFFIX}"));
        let file = File::create(&temp_path).await?;

        Ok(Box::new(LocalUpload {
            key: key.to_string(),
            file: Some(file),
            temp_path,
            final_path: dir.join(key),
            finished: false,
        }))
    }

    async fn download_object(&self, bucket: &str, key: &str) -> CoreResult<ByteStream> {
        validate_key(key)?;
        let dir = self.existing_bucket_dir(bucket).await?;

        let file = File::open(dir.join(key)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found("object", key)
            } else {
                CoreError::from(e)
            }
        })?;

        Ok(futures::stream::try_unfold(file, read_chunk).boxed())
    }

    async fn list_objects(&self, bucket: &str) -> CoreResult<Vec<ObjectInfo>> {
        let dir = self.existing_bucket_dir(bucket).await?;

        let mut results = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let Ok(key) = entry.file_name().into_string() else {
                continue;
            };
            // In-flight uploads
            if key.starts_with('.') {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            results.push(ObjectInfo {
                key,
                size_bytes: metadata.len(),
                last_modified: metadata
                    .modified()
                    .ok()
                    .and_then(|t| {
                        t.duration_since(UNIX_EPOCH)
                            .ok()
                            .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
                    })
                    .unwrap_or_else(Utc::now),
            });
        }

        Ok(results)
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

async fn read_chunk(mut file: File) -> CoreResult<Option<(Bytes, File)>> {
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let n = file.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some((Bytes::from(buf), file)))
}

struct LocalUpload {
    key: String,
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl LocalUpload {
    fn open_file(&mut self) -> CoreResult<&mut File> {
        match self.file.as_mut() {
            Some(file) if !self.finished => Ok(file),
            _ => Err(CoreError::already_finished(&self.key)),
        }
    }
}

#[async_trait]
impl Upload for LocalUpload {
    fn key(&self) -> &str {
        &self.key
    }

    async fn write(&mut self, chunk: Bytes) -> CoreResult<()> {
        self.open_file()?.write_all(&chunk).await?;
        Ok(())
    }

    async fn commit(&mut self) -> CoreResult<()> {
        let file = self.open_file()?;
        file.flush().await?;
        file.sync_all().await?;
        self.file = None;

        // On failure the upload stays open so abort can still clean up.
        if let Err(e) = tokio::fs::rename(&self.temp_path, &self.final_path).await {
            return Err(CoreError::StorageError(format!(
                "commit of `{}` failed: {e}",
                self.key
            )));
        }
        self.finished = true;
        Ok(())
    }

    async fn abort(&mut self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::already_finished(&self.key));
        }
        self.file = None;
        self.finished = true;

        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LocalUpload {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
