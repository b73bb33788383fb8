use thiserror::Error;

/// Canonical error type shared by the tiering crates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not found in the addressed store.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"object"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Object key does not have the `<low>-<high>[.gz]` shape.
    #[error("malformed segment key `{key}`: {reason}")]
    MalformedKey {
        /// The offending key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Segment range whose low bound sorts after its high bound.
    #[error("invalid segment range: {low} > {high}")]
    InvalidRange {
        /// Textual low bound.
        low: String,
        /// Textual high bound.
        high: String,
    },

    /// Text that is not a canonical segment identifier.
    #[error("invalid segment id `{value}`: {reason}")]
    InvalidId {
        /// The rejected text.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Text that is neither a segment identifier nor an RFC 3339 timestamp.
    #[error("invalid time bound `{value}`")]
    InvalidTime {
        /// The rejected text.
        value: String,
    },

    /// Upload was already committed or aborted.
    #[error("upload `{key}` already finished")]
    AlreadyFinished {
        /// Key of the finished upload.
        key: String,
    },

    /// Operation exceeded its time budget.
    #[error("{op} timed out after {secs}s")]
    Timeout {
        /// Name of the bounded operation.
        op: &'static str,
        /// Budget that elapsed.
        secs: u64,
    },

    /// Bucket could not be ensured while constructing a tiered log.
    #[error("ensure bucket `{bucket}` failed: {source}")]
    BucketEnsureFailed {
        /// Bucket name.
        bucket: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Blob-store upload could not be opened.
    #[error("upload open failed for `{key}`: {source}")]
    UploadOpenFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Copying bytes between a source and a destination failed.
    #[error("copy failed for `{key}`: {source}")]
    CopyFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Gzip trailer could not be written.
    #[error("compressor close failed for `{key}`: {source}")]
    CompressorCloseFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Blob-store upload could not be committed.
    #[error("commit failed for `{key}`: {source}")]
    CommitFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Local copy could not be removed after the cold copy was committed.
    #[error("local purge failed for `{key}`: {source}")]
    LocalPurgeFailed {
        /// Object key the segment was archived under.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Blob-store download could not be opened.
    #[error("download open failed for `{key}`: {source}")]
    DownloadOpenFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// Downloaded bytes are not valid gzip.
    #[error("decompress failed for `{key}`: {source}")]
    DecompressFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// I/O error occurred during file or network operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Validation error for input data.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    ConfigError(#[from] config::ConfigError),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates a `MalformedKey` variant.
    #[must_use]
    pub fn malformed_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `AlreadyFinished` variant.
    #[must_use]
    pub fn already_finished(key: impl Into<String>) -> Self {
        Self::AlreadyFinished { key: key.into() }
    }

    /// Returns true for the "upload already committed/aborted" condition.
    #[must_use]
    pub fn is_already_finished(&self) -> bool {
        matches!(self, Self::AlreadyFinished { .. })
    }

    /// Returns true when the error, or the step error it wraps, is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            _ => self.step_source().is_some_and(CoreError::is_timeout),
        }
    }

    /// Name of the failing step for step-wrapping variants.
    #[must_use]
    pub fn step(&self) -> Option<&'static str> {
        Some(match self {
            Self::BucketEnsureFailed { .. } => "ensure_bucket",
            Self::UploadOpenFailed { .. } => "upload_open",
            Self::CopyFailed { .. } => "copy",
            Self::CompressorCloseFailed { .. } => "compressor_close",
            Self::CommitFailed { .. } => "commit",
            Self::LocalPurgeFailed { .. } => "local_purge",
            Self::DownloadOpenFailed { .. } => "download_open",
            Self::DecompressFailed { .. } => "decompress",
            _ => return None,
        })
    }

    fn step_source(&self) -> Option<&CoreError> {
        match self {
            Self::BucketEnsureFailed { source, .. }
            | Self::UploadOpenFailed { source, .. }
            | Self::CopyFailed { source, .. }
            | Self::CompressorCloseFailed { source, .. }
            | Self::CommitFailed { source, .. }
            | Self::LocalPurgeFailed { source, .. }
            | Self::DownloadOpenFailed { source, .. }
            | Self::DecompressFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convenient result alias for tiering operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names() {
        let err = CoreError::CommitFailed {
            key: "a-b.gz".to_string(),
            source: Box::new(CoreError::StorageError("503".to_string())),
        };
        assert_eq!(err.step(), Some("commit"));
        assert!(err.to_string().contains("commit failed"));
        assert!(err.to_string().contains("503"));

        assert_eq!(CoreError::StorageError("x".to_string()).step(), None);
    }

    #[test]
    fn test_timeout_detection_through_wrapper() {
        let err = CoreError::CopyFailed {
            key: "k".to_string(),
            source: Box::new(CoreError::Timeout {
                op: "upload",
                secs: 15,
            }),
        };
        assert!(err.is_timeout());
        assert!(!CoreError::already_finished("k").is_timeout());
        assert!(CoreError::already_finished("k").is_already_finished());
    }
}
