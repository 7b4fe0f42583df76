//! Batched ingestion of time-series records into the columnar store.
//!
//! Records arrive from the HTTP endpoint, from ingestion tasks, or from the
//! Redpanda tick feed. They are buffered, flushed in size- or time-bounded
//! batches, and spilled locally when the store stays unavailable.

pub mod buffer;
pub mod config;
pub mod feed;
pub mod health;
pub mod line_protocol;
pub mod pipeline;
pub mod spill;

pub use buffer::RecordBuffer;
pub use config::{FailurePolicy, FeedConfig, PipelineConfig};
pub use feed::{decode_tick, Offset, TickFeed};
pub use health::check_feed;
pub use pipeline::{FlushOutcome, IngestionPipeline, PipelineStats};
pub use spill::SpillDir;
