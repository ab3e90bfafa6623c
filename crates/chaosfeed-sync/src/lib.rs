//! Ingestion: configuration, the poll loops and the one-shot backfill.

pub mod backfill;
pub mod config;
pub mod ingester;
pub mod sink;
pub mod status;

pub use backfill::{run_backfill, BackfillOptions, BackfillReport, StepCounts};
pub use config::{ConfigError, FeedConfig};
pub use ingester::{CycleReport, Ingester, IngesterHandle, IngesterSettings};
pub use sink::{BackfillStore, EventSink, MemorySink};
pub use status::{IngesterStatus, LoopKind, LoopStatus, StatusBoard};

pub const CRATE_NAME: &str = "chaosfeed-sync";
