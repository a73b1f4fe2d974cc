// ABOUTME: Library root for iceberg-replicator
// ABOUTME: Table-format engine plus watermark-driven incremental sync between databases

pub mod config;
pub mod error;
pub mod iceberg;
pub mod sync;
pub mod utils;

pub use error::{ReplicatorError, Result};
