// ABOUTME: WatermarkStore - durable last-synced value per table for incremental syncs
// ABOUTME: One JSON file per table, replaced atomically via temp-file-then-rename

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReplicatorError, Result};
use crate::iceberg::types::Value;
use crate::utils::{file_stem_for, write_atomic};

/// High-water mark of a change-detection column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatermarkValue {
    Integer(i64),
    Timestamp(NaiveDateTime),
}

impl WatermarkValue {
    /// Watermark candidate for a column value; `None` for nulls and non-monotonic kinds.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(WatermarkValue::Integer(*i as i64)),
            Value::Long(l) => Some(WatermarkValue::Integer(*l)),
            Value::Timestamp(ts) => Some(WatermarkValue::Timestamp(*ts)),
            Value::Timestamptz(ts) => Some(WatermarkValue::Timestamp(ts.naive_utc())),
            Value::Date(d) => d.and_hms_opt(0, 0, 0).map(WatermarkValue::Timestamp),
            _ => None,
        }
    }

    /// Order two watermarks of the same kind.
    pub fn compare(&self, other: &WatermarkValue) -> Option<Ordering> {
        match (self, other) {
            (WatermarkValue::Integer(a), WatermarkValue::Integer(b)) => Some(a.cmp(b)),
            (WatermarkValue::Timestamp(a), WatermarkValue::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkValue::Integer(i) => write!(f, "{}", i),
            WatermarkValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// Persisted watermark for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// Table-format table name the watermark belongs to
    pub table: String,
    /// Change-detection column
    pub column: String,
    /// Highest value already merged into the destination
    pub value: WatermarkValue,
    /// When the watermark was last advanced
    #[serde(rename = "asOf")]
    pub as_of: DateTime<Utc>,
}

/// File-backed watermark persistence.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    /// Open (creating if needed) a watermark directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ReplicatorError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Default watermark directory for the current working directory
    pub fn default_dir() -> PathBuf {
        PathBuf::from(".iceberg-replicator/watermarks")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(table)))
    }

    /// Last committed watermark, `None` on first run.
    ///
    /// A file recorded for a different table (names that differ only in case
    /// on a case-insensitive filesystem) is an error, never another table's value.
    pub fn get(&self, table: &str) -> Result<Option<Watermark>> {
        let path = self.path_for(table);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReplicatorError::io(&path, e)),
        };
        let watermark: Watermark = serde_json::from_slice(&contents)?;
        if watermark.table != table {
            return Err(ReplicatorError::Config(format!(
                "watermark file {} belongs to table '{}', not '{}'",
                path.display(),
                watermark.table,
                table
            )));
        }
        Ok(Some(watermark))
    }

    /// Atomically replace the watermark of `table`.
    pub fn set(&self, table: &str, column: &str, value: WatermarkValue) -> Result<Watermark> {
        // Refuses to overwrite a file owned by another table
        self.get(table)?;
        let watermark = Watermark {
            table: table.to_string(),
            column: column.to_string(),
            value,
            as_of: Utc::now(),
        };
        let contents = serde_json::to_vec_pretty(&watermark)?;
        write_atomic(&self.path_for(table), &contents)?;
        tracing::debug!("Watermark for '{}' set to {}", table, value);
        Ok(watermark)
    }

    /// Forget the watermark so the next cycle re-extracts everything.
    ///
    /// Returns whether a watermark existed.
    pub fn reset(&self, table: &str) -> Result<bool> {
        let path = self.path_for(table);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ReplicatorError::io(&path, e)),
        }
    }

    /// All stored watermarks, sorted by table.
    pub fn list(&self) -> Result<Vec<Watermark>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| ReplicatorError::io(&self.dir, e))?;
        let mut watermarks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ReplicatorError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read(&path).map_err(|e| ReplicatorError::io(&path, e))?;
            match serde_json::from_slice::<Watermark>(&contents) {
                Ok(watermark) => watermarks.push(watermark),
                Err(e) => tracing::warn!("Skipping unreadable watermark {:?}: {}", path, e),
            }
        }
        watermarks.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(watermarks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn ts(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_similar_table_names_keep_separate_watermarks() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();
        store.set("sales q1", "seq", WatermarkValue::Integer(500)).unwrap();

        assert!(store.get("sales_q1").unwrap().is_none());
        store.set("sales_q1", "seq", WatermarkValue::Integer(7)).unwrap();
        assert_eq!(
            store.get("sales q1").unwrap().unwrap().value,
            WatermarkValue::Integer(500)
        );
        assert_eq!(
            store.get("sales_q1").unwrap().unwrap().value,
            WatermarkValue::Integer(7)
        );
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_watermark_of_another_table_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();
        store.set("Orders", "seq", WatermarkValue::Integer(9)).unwrap();

        // Simulate a case-insensitive filesystem mapping both names to one file
        fs::copy(
            dir.path().join("Orders.json"),
            dir.path().join("orders.json"),
        )
        .unwrap();
        assert!(matches!(
            store.get("orders").unwrap_err(),
            ReplicatorError::Config(_)
        ));
        assert!(store
            .set("orders", "seq", WatermarkValue::Integer(1))
            .is_err());
    }

    #[test]
    fn test_get_returns_none_on_first_run() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();
        assert!(store.get("orders").unwrap().is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();

        store
            .set("orders", "updated_at", WatermarkValue::Timestamp(ts(1)))
            .unwrap();
        store
            .set("orders", "updated_at", WatermarkValue::Timestamp(ts(2)))
            .unwrap();

        let watermark = store.get("orders").unwrap().unwrap();
        assert_eq!(watermark.value, WatermarkValue::Timestamp(ts(2)));
        assert_eq!(watermark.column, "updated_at");
    }

    #[test]
    fn test_file_shape() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();
        store
            .set("main.orders", "id", WatermarkValue::Integer(42))
            .unwrap();

        let raw = fs::read_to_string(dir.path().join("main.orders.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["table"], "main.orders");
        assert_eq!(json["column"], "id");
        assert_eq!(json["value"], 42);
        assert!(json["asOf"].is_string());
    }

    #[test]
    fn test_reset_and_list() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();
        store.set("b", "id", WatermarkValue::Integer(1)).unwrap();
        store.set("a", "id", WatermarkValue::Integer(2)).unwrap();

        let tables: Vec<String> = store.list().unwrap().into_iter().map(|w| w.table).collect();
        assert_eq!(tables, vec!["a".to_string(), "b".to_string()]);

        assert!(store.reset("a").unwrap());
        assert!(!store.reset("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_watermark_value_from_column_values() {
        assert_eq!(
            WatermarkValue::from_value(&Value::Int(3)),
            Some(WatermarkValue::Integer(3))
        );
        assert_eq!(
            WatermarkValue::from_value(&Value::Timestamp(ts(5))),
            Some(WatermarkValue::Timestamp(ts(5)))
        );
        assert_eq!(WatermarkValue::from_value(&Value::Null), None);
        assert_eq!(WatermarkValue::from_value(&Value::String("x".into())), None);
    }
}
