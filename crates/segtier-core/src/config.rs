//! Configuration for the tiering layer
//!
//! Sources, lowest priority first:
//! - Hardcoded defaults
//! - `./config/segtier.{yaml,toml,json}`
//! - File named by the `SEGTIER_CONFIG` env var
//! - Environment variables with the `SEGTIER__` prefix

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Order in which a range read visits listed cold objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingOrder {
    /// Sort the listing by decoded segment range before downloading.
    #[default]
    Sorted,
    /// Visit objects in whatever order the blob store lists them.
    AsListed,
}

/// Tiering configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierConfig {
    /// Bucket holding archived segments
    pub bucket: String,

    /// Budget for one archival upload, in seconds
    pub upload_timeout_secs: u64,

    /// Budget for one range read, in seconds
    pub read_timeout_secs: u64,

    /// Bytes read from a local segment per compression step
    pub chunk_size: usize,

    /// Chunks buffered between a range-read worker and its consumer
    pub pipe_capacity: usize,

    /// Gzip level (0-9)
    pub compression_level: u32,

    #[serde(default)]
    pub listing_order: ListingOrder,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            bucket: "segtier".to_string(),
            upload_timeout_secs: 15,
            read_timeout_secs: 15,
            chunk_size: 64 * 1024,
            pipe_capacity: 4,
            compression_level: 6,
            listing_order: ListingOrder::Sorted,
        }
    }
}

impl TierConfig {
    /// Load configuration from defaults, files and environment.
    ///
    /// Example override: `SEGTIER__READ_TIMEOUT_SECS=30`
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults(Config::builder())?;

        builder = builder.add_source(File::with_name("./config/segtier").required(false));

        if let Ok(config_path) = std::env::var("SEGTIER_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("SEGTIER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TierConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: TierConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = Self::default();
        builder
            .set_default("bucket", defaults.bucket)?
            .set_default("upload_timeout_secs", defaults.upload_timeout_secs)?
            .set_default("read_timeout_secs", defaults.read_timeout_secs)?
            .set_default("chunk_size", defaults.chunk_size as u64)?
            .set_default("pipe_capacity", defaults.pipe_capacity as u64)?
            .set_default("compression_level", defaults.compression_level)?
            .set_default("listing_order", "sorted")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::Message("bucket must not be empty".to_string()));
        }
        if self.upload_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "upload_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "read_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Message("chunk_size must be > 0".to_string()));
        }
        if self.pipe_capacity == 0 {
            return Err(ConfigError::Message("pipe_capacity must be > 0".to_string()));
        }
        if self.compression_level > 9 {
            return Err(ConfigError::Message(format!(
                "compression_level must be <= 9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Same configuration targeting another bucket.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }
}
