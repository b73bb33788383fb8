//! Core domain types for the SegTier cold-storage tiering layer.

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod query;
pub mod segment;

pub use config::{ListingOrder, TierConfig};
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventSink, MemoryEventSink, TracingEventSink};
pub use ids::SegmentId;
pub use query::{QueryRange, TimeBound};
pub use segment::{SegmentKey, SegmentRange, COMPRESSED_SUFFIX};
