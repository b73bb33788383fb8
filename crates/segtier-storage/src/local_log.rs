//! Local segment store capability and its file-backed implementation
//!
//! The tiering layer only needs two things from the primary log store: the
//! list of segments old enough to be purged, and for each of them a handle
//! that can be read and deleted. [`FileLogStore`] provides both over a
//! directory of sealed segment files named `<low>-<high>.flushed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use segtier_core::{CoreError, CoreResult, SegmentKey, SegmentRange};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Extension of a sealed, no longer written segment file.
pub const FLUSHED_EXTENSION: &str = ".flushed";

/// Readable body of a local segment.
pub type SegmentReader = Box<dyn AsyncRead + Send + Unpin>;

/// One local segment eligible for deletion.
#[async_trait]
pub trait TrashSegment: Send + Sync {
    /// File name of the segment, e.g. `<low>-<high>.flushed`.
    fn name(&self) -> &str;

    /// Opens the segment bytes for reading.
    async fn open(&self) -> CoreResult<SegmentReader>;

    /// Removes the segment.
    async fn purge(&self) -> CoreResult<()>;
}

/// Age-based purge discovery of a segmented log store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Segments last written before `cutoff`.
    async fn purgeable(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Box<dyn TrashSegment>>>;
}

/// Directory of sealed segment files.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub async fn new(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a segment covering `range` is sealed under.
    pub fn segment_path(&self, range: &SegmentRange) -> PathBuf {
        self.dir.join(format!("{range}{FLUSHED_EXTENSION}"))
    }

    /// Write a sealed segment.
    ///
    /// The bytes land in a temporary file first and are renamed into place,
    /// so a crash never leaves a truncated `.flushed` file behind.
    pub async fn seal(&self, range: &SegmentRange, data: &[u8]) -> CoreResult<PathBuf> {
        let path = self.segment_path(range);
        let temp = self.dir.join(format!(".{range}.tmp"));

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &path).await?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "Sealed segment");
        Ok(path)
    }

    /// Every sealed segment with its modification time, ordered by range.
    pub async fn segments(&self) -> CoreResult<Vec<(SegmentRange, PathBuf, DateTime<Utc>)>> {
        let mut segments = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.ends_with(FLUSHED_EXTENSION) || name.starts_with('.') {
                continue;
            }

            let range = match SegmentKey::from_file_name(&name) {
                Ok(key) => key.range(),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Skipping unrecognised segment file");
                    continue;
                }
            };

            let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
            segments.push((range, entry.path(), modified));
        }

        segments.sort_by_key(|(range, _, _)| *range);
        Ok(segments)
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn purgeable(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Box<dyn TrashSegment>>> {
        let purgeable: Vec<Box<dyn TrashSegment>> = self
            .segments()
            .await?
            .into_iter()
            .filter(|(_, _, modified)| *modified < cutoff)
            .map(|(_, path, _)| Box::new(FileTrashSegment::new(path)) as Box<dyn TrashSegment>)
            .collect();

        tracing::debug!(
            dir = %self.dir.display(),
            cutoff = %cutoff,
            count = purgeable.len(),
            "Collected purgeable segments"
        );
        Ok(purgeable)
    }
}

/// A sealed segment file slated for deletion.
#[derive(Debug, Clone)]
pub struct FileTrashSegment {
    name: String,
    path: PathBuf,
}

impl FileTrashSegment {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { name, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrashSegment for FileTrashSegment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> CoreResult<SegmentReader> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found("segment", &self.name)
            } else {
                CoreError::from(e)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn purge(&self) -> CoreResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            // Already gone: a retried purge is a no-op.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use segtier_core::SegmentId;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn range(low_ms: u64, high_ms: u64) -> SegmentRange {
        SegmentRange::new(
            SegmentId::from_parts(low_ms, 0),
            SegmentId::from_parts(high_ms, 0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_seal_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLogStore::new(temp_dir.path()).await.unwrap();

        let path = store.seal(&range(1, 2), b"segment bytes").await.unwrap();
        assert!(path.to_string_lossy().ends_with(FLUSHED_EXTENSION));

        let segment = FileTrashSegment::new(path);
        let mut body = Vec::new();
        segment.open().await.unwrap().read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"segment bytes");
    }

    #[tokio::test]
    async fn test_purgeable_respects_cutoff() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLogStore::new(temp_dir.path()).await.unwrap();
        store.seal(&range(3, 4), b"b").await.unwrap();
        store.seal(&range(1, 2), b"a").await.unwrap();

        let past = Utc::now() - Duration::hours(1);
        assert!(store.purgeable(past).await.unwrap().is_empty());

        let future = Utc::now() + Duration::minutes(1);
        let names: Vec<String> = store
            .purgeable(future)
            .await
            .unwrap()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                format!("{}{FLUSHED_EXTENSION}", range(1, 2)),
                format!("{}{FLUSHED_EXTENSION}", range(3, 4)),
            ]
        );
    }

    #[tokio::test]
    async fn test_purgeable_ignores_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLogStore::new(temp_dir.path()).await.unwrap();
        store.seal(&range(1, 2), b"a").await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(temp_dir.path().join("garbage.flushed"), b"x").unwrap();

        let future = Utc::now() + Duration::minutes(1);
        assert_eq!(store.purgeable(future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLogStore::new(temp_dir.path()).await.unwrap();
        let segment = FileTrashSegment::new(store.seal(&range(1, 2), b"a").await.unwrap());

        segment.purge().await.unwrap();
        assert!(!segment.path().exists());
        segment.purge().await.unwrap();

        assert!(matches!(
            segment.open().await,
            Err(CoreError::NotFound { entity: "segment", .. })
        ));
    }
}
