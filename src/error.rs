// ABOUTME: Error taxonomy for the table-format engine and the sync coordinator
// ABOUTME: Distinguishes fatal catalog/schema errors from the retryable commit conflict

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = ReplicatorError> = std::result::Result<T, E>;

/// Errors raised by schema translation, file writing, catalog commits and sync cycles.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// A source column type has no mapping to a table-format type.
    #[error("Unsupported type '{native_type}' for column '{column}'")]
    UnsupportedType { column: String, native_type: String },

    /// An existing column changed in a way the table format cannot express.
    #[error("Incompatible schema change for column '{column}': {from} -> {to}")]
    IncompatibleSchemaChange {
        column: String,
        from: String,
        to: String,
    },

    /// `create` was called for a table whose pointer file already exists.
    #[error("Table '{0}' already exists")]
    TableAlreadyExists(String),

    /// No pointer file exists for the table.
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    /// The pointer or the metadata file it references is missing or malformed.
    #[error("Corrupt catalog for table '{table}': {message}")]
    CorruptCatalog { table: String, message: String },

    /// The pointer moved between load and commit. Reload and retry.
    #[error("Concurrent commit conflict on '{table}': expected version {expected}, found {actual}")]
    ConcurrentCommitConflict {
        table: String,
        expected: u64,
        actual: u64,
    },

    /// Atomic rename requires source and destination on one volume.
    #[error("Cannot atomically rename {from:?} to {to:?}: paths are on different filesystems")]
    CrossDeviceRename { from: PathBuf, to: PathBuf },

    /// Reading rows from the source failed. Nothing was committed.
    #[error("Extraction failed for '{table}': {message}")]
    Extraction { table: String, message: String },

    /// Applying rows to the destination failed. The watermark was not advanced.
    #[error("Destination write failed for '{table}': {message}")]
    DestinationWrite { table: String, message: String },

    /// Invalid job or CLI configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Data did not match the expected shape (row width, value kind, watermark type).
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplicatorError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReplicatorError::Io {
            path: path.into(),
            source,
        }
    }

    /// Only a commit conflict may be retried; every other error is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplicatorError::ConcurrentCommitConflict { .. })
    }

    /// Short, stable label for the error kind (used in cycle results and logs).
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicatorError::UnsupportedType { .. } => "unsupported_type",
            ReplicatorError::IncompatibleSchemaChange { .. } => "incompatible_schema_change",
            ReplicatorError::TableAlreadyExists(_) => "table_already_exists",
            ReplicatorError::TableNotFound(_) => "table_not_found",
            ReplicatorError::CorruptCatalog { .. } => "corrupt_catalog",
            ReplicatorError::ConcurrentCommitConflict { .. } => "concurrent_commit_conflict",
            ReplicatorError::CrossDeviceRename { .. } => "cross_device_rename",
            ReplicatorError::Extraction { .. } => "extraction",
            ReplicatorError::DestinationWrite { .. } => "destination_write",
            ReplicatorError::Config(_) => "config",
            ReplicatorError::InvalidData(_) => "invalid_data",
            ReplicatorError::Io { .. } => "io",
            ReplicatorError::Parquet(_) => "parquet",
            ReplicatorError::Arrow(_) => "arrow",
            ReplicatorError::Avro(_) => "avro",
            ReplicatorError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflict_is_retryable() {
        let conflict = ReplicatorError::ConcurrentCommitConflict {
            table: "orders".to_string(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_retryable());
        assert_eq!(conflict.kind(), "concurrent_commit_conflict");

        let corrupt = ReplicatorError::CorruptCatalog {
            table: "orders".to_string(),
            message: "missing v4.metadata.json".to_string(),
        };
        assert!(!corrupt.is_retryable());
        assert!(!ReplicatorError::TableNotFound("orders".to_string()).is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_table() {
        let err = ReplicatorError::DestinationWrite {
            table: "main.orders".to_string(),
            message: "UNIQUE constraint failed".to_string(),
        };
        assert!(err.to_string().contains("main.orders"));
        assert!(err.to_string().contains("UNIQUE constraint failed"));
    }
}
