// ABOUTME: Incremental synchronization - watermarks, change detection and the sync cycle
// ABOUTME: Moves changed source rows through the table format into a destination database

pub mod change_detection;
pub mod coordinator;
pub mod daemon;
pub mod sink;
pub mod source;
pub mod watermark;

pub use change_detection::{ChangeDetectionKind, ChangeDetectionStrategy, ExtractionPredicate};
pub use coordinator::{CoordinatorConfig, CycleResult, IncrementalSyncCoordinator, MergeStrategy};
pub use daemon::{DaemonConfig, SyncDaemon};
pub use sink::{DestinationSink, SqliteSink};
pub use source::{RowSource, SqliteSource};
pub use watermark::{Watermark, WatermarkStore, WatermarkValue};
