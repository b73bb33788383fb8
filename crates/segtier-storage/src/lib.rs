//! Cold-storage tiering for a segmented log store.
//!
//! - [`blob_store`]: bucket-scoped object storage (local, mock, S3)
//! - [`local_log`]: the local segment store capability
//! - [`purger`]: archive a purgeable segment, then delete it
//! - [`reader`]: stream archived content overlapping a query
//! - [`tiered`]: a local store whose purges go through the cold tier

pub mod blob_store;
pub mod compression;
pub mod local_log;
pub mod purger;
pub mod reader;
pub mod tiered;

pub use blob_store::{
    BlobStore, LocalBlobStore, MockBlobStore, ObjectInfo, S3BlobStore, S3Config, Upload,
};
pub use local_log::{FileLogStore, FileTrashSegment, LogStore, TrashSegment};
pub use purger::{ArchivalPurger, ArchiveReceipt};
pub use reader::{ColdRangeReader, RangeStream};
pub use tiered::{ArchiveReport, ArchiveSummary, ArchivedTrashSegment, TieredLog};
