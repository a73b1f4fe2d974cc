// ABOUTME: Table metadata document (format version 2): schemas, specs, snapshots and logs
// ABOUTME: Serialized as v<N>.metadata.json with kebab-case keys

use std::collections::BTreeMap;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::data_file::DataFile;
use crate::iceberg::types::{PrimitiveType, TableSchema};

pub const FORMAT_VERSION: i32 = 2;
pub const MAIN_BRANCH: &str = "main";
/// Partition field ids start above this value.
pub const PARTITION_FIELD_ID_START: i32 = 999;

/// Root metadata document of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    pub format_version: i32,
    pub table_uuid: Uuid,
    pub location: String,
    pub last_sequence_number: i64,
    pub last_updated_ms: i64,
    /// Highest field id ever assigned; never decreases.
    pub last_column_id: i32,
    pub schemas: Vec<TableSchema>,
    pub current_schema_id: i32,
    pub partition_specs: Vec<PartitionSpec>,
    pub default_spec_id: i32,
    pub last_partition_id: i32,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<i64>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLogEntry>,
    #[serde(default)]
    pub metadata_log: Vec<MetadataLogEntry>,
    pub sort_orders: Vec<SortOrder>,
    pub default_sort_order_id: i32,
    #[serde(default)]
    pub refs: BTreeMap<String, SnapshotRef>,
}

/// Immutable table state produced by one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub snapshot_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub timestamp_ms: i64,
    pub manifest_list: String,
    /// Includes the `operation` key.
    pub summary: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotLogEntry {
    pub snapshot_id: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataLogEntry {
    pub metadata_file: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    pub spec_id: i32,
    #[serde(default)]
    pub fields: Vec<PartitionField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionField {
    pub source_id: i32,
    pub field_id: i32,
    pub name: String,
    pub transform: String,
}

impl PartitionSpec {
    pub fn unpartitioned() -> Self {
        Self {
            spec_id: 0,
            fields: Vec::new(),
        }
    }

    /// Identity partitioning on the named source columns, ids from 1000.
    pub fn identity(spec_id: i32, schema: &TableSchema, columns: &[&str]) -> Result<Self> {
        let mut fields = Vec::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let source = schema.field_by_name(column).ok_or_else(|| {
                ReplicatorError::Config(format!("partition column '{}' not in schema", column))
            })?;
            fields.push(PartitionField {
                source_id: source.id,
                field_id: PARTITION_FIELD_ID_START + 1 + idx as i32,
                name: source.name.clone(),
                transform: "identity".to_string(),
            });
        }
        Ok(Self { spec_id, fields })
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.fields.is_empty()
    }

    /// Result type of each partition field (identity keeps the source type).
    pub fn partition_types(&self, schema: &TableSchema) -> Result<Vec<PrimitiveType>> {
        self.fields
            .iter()
            .map(|pf| {
                if pf.transform != "identity" {
                    return Err(ReplicatorError::InvalidData(format!(
                        "unsupported partition transform '{}'",
                        pf.transform
                    )));
                }
                schema
                    .field_by_id(pf.source_id)
                    .map(|f| f.field_type)
                    .ok_or_else(|| {
                        ReplicatorError::InvalidData(format!(
                            "partition source field {} not in schema {}",
                            pf.source_id, schema.schema_id
                        ))
                    })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortOrder {
    pub order_id: i32,
    #[serde(default)]
    pub fields: Vec<SortField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortField {
    pub source_id: i32,
    pub transform: String,
    pub direction: String,
    pub null_order: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotRef {
    pub snapshot_id: i64,
    #[serde(rename = "type")]
    pub ref_type: String,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl TableMetadata {
    /// Metadata for a freshly created table: one schema, no snapshots.
    pub fn new(location: &str, schema: TableSchema, last_column_id: i32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            location: location.to_string(),
            last_sequence_number: 0,
            last_updated_ms: now_ms(),
            last_column_id: last_column_id.max(schema.highest_field_id()),
            current_schema_id: schema.schema_id,
            schemas: vec![schema],
            partition_specs: vec![PartitionSpec::unpartitioned()],
            default_spec_id: 0,
            last_partition_id: PARTITION_FIELD_ID_START,
            properties: BTreeMap::new(),
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
            metadata_log: Vec::new(),
            sort_orders: vec![SortOrder {
                order_id: 0,
                fields: Vec::new(),
            }],
            default_sort_order_id: 0,
            refs: BTreeMap::new(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let metadata: TableMetadata = serde_json::from_slice(bytes)?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn current_schema(&self) -> Result<&TableSchema> {
        self.schema_by_id(self.current_schema_id).ok_or_else(|| {
            ReplicatorError::InvalidData(format!(
                "current schema {} not found",
                self.current_schema_id
            ))
        })
    }

    pub fn schema_by_id(&self, schema_id: i32) -> Option<&TableSchema> {
        self.schemas.iter().find(|s| s.schema_id == schema_id)
    }

    pub fn default_partition_spec(&self) -> Result<&PartitionSpec> {
        self.partition_specs
            .iter()
            .find(|s| s.spec_id == self.default_spec_id)
            .ok_or_else(|| {
                ReplicatorError::InvalidData(format!(
                    "default partition spec {} not found",
                    self.default_spec_id
                ))
            })
    }

    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id
            .and_then(|id| self.snapshot_by_id(id))
    }

    pub fn snapshot_by_id(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Add (or select) a schema version and make it current.
    pub fn add_schema(&mut self, schema: TableSchema, last_column_id: i32) {
        let schema_id = schema.schema_id;
        match self.schemas.iter().find(|s| s.schema_id == schema_id) {
            Some(existing) if existing.same_fields(&schema) => {}
            _ => {
                self.schemas.retain(|s| s.schema_id != schema_id);
                self.schemas.push(schema);
            }
        }
        self.current_schema_id = schema_id;
        self.last_column_id = self.last_column_id.max(last_column_id);
    }

    /// Replace the default spec with one that partitions by identity on `columns`.
    pub fn set_identity_partitioning(&mut self, columns: &[&str]) -> Result<()> {
        let next_spec_id = self.partition_specs.iter().map(|s| s.spec_id).max().unwrap_or(0) + 1;
        let mut spec = PartitionSpec::identity(next_spec_id, self.current_schema()?, columns)?;
        for field in spec.fields.iter_mut() {
            self.last_partition_id += 1;
            field.field_id = self.last_partition_id;
        }
        self.default_spec_id = spec.spec_id;
        self.partition_specs.push(spec);
        Ok(())
    }

    /// Snapshot id not used by any existing snapshot.
    pub fn new_snapshot_id(&self) -> i64 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: i64 = rng.gen_range(1..i64::MAX);
            if self.snapshot_by_id(candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Record a committed snapshot and point the main branch at it.
    pub fn add_snapshot(&mut self, snapshot: Snapshot) {
        self.last_sequence_number = self.last_sequence_number.max(snapshot.sequence_number);
        self.last_updated_ms = snapshot.timestamp_ms;
        self.current_snapshot_id = Some(snapshot.snapshot_id);
        self.refs.insert(
            MAIN_BRANCH.to_string(),
            SnapshotRef {
                snapshot_id: snapshot.snapshot_id,
                ref_type: "branch".to_string(),
            },
        );
        self.snapshot_log.push(SnapshotLogEntry {
            snapshot_id: snapshot.snapshot_id,
            timestamp_ms: snapshot.timestamp_ms,
        });
        self.snapshots.push(snapshot);
    }

    /// Check structural invariants of a loaded or about-to-be-written document.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(ReplicatorError::InvalidData(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        self.current_schema()?;
        self.default_partition_spec()?;
        for schema in &self.schemas {
            if let Some(field) = schema.fields.iter().find(|f| f.id <= 0 || f.id > self.last_column_id) {
                return Err(ReplicatorError::InvalidData(format!(
                    "field '{}' has id {} outside 1..={}",
                    field.name, field.id, self.last_column_id
                )));
            }
        }
        for snapshot in &self.snapshots {
            if let Some(schema_id) = snapshot.schema_id {
                if self.schema_by_id(schema_id).is_none() {
                    return Err(ReplicatorError::InvalidData(format!(
                        "snapshot {} references missing schema {}",
                        snapshot.snapshot_id, schema_id
                    )));
                }
            }
        }
        if let Some(id) = self.current_snapshot_id {
            if self.snapshot_by_id(id).is_none() {
                return Err(ReplicatorError::InvalidData(format!(
                    "current snapshot {} not found",
                    id
                )));
            }
        }
        Ok(())
    }
}

/// Summary for an append snapshot, with totals carried from the parent.
pub fn append_summary(
    parent: Option<&Snapshot>,
    added: &[DataFile],
) -> BTreeMap<String, String> {
    let added_files = added.len() as i64;
    let added_records: i64 = added.iter().map(|f| f.record_count).sum();
    let added_size: i64 = added.iter().map(|f| f.file_size_in_bytes).sum();

    let parent_total = |key: &str| -> i64 {
        parent
            .and_then(|p| p.summary.get(key))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    BTreeMap::from([
        ("operation".to_string(), "append".to_string()),
        ("added-data-files".to_string(), added_files.to_string()),
        ("added-records".to_string(), added_records.to_string()),
        ("added-files-size".to_string(), added_size.to_string()),
        (
            "total-data-files".to_string(),
            (parent_total("total-data-files") + added_files).to_string(),
        ),
        (
            "total-records".to_string(),
            (parent_total("total-records") + added_records).to_string(),
        ),
        (
            "total-files-size".to_string(),
            (parent_total("total-files-size") + added_size).to_string(),
        ),
        ("total-delete-files".to_string(), "0".to_string()),
        ("total-position-deletes".to_string(), "0".to_string()),
        ("total-equality-deletes".to_string(), "0".to_string()),
    ])
}
