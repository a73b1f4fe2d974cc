// ABOUTME: ManifestListWriter - one entry per manifest of a snapshot, with partition summaries
// ABOUTME: Carries parent manifests forward unchanged next to the newly added one

use std::path::Path;

use apache_avro::types::Value as AvroValue;
use serde_json::json;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::avro::{
    self, as_array, as_bool, as_int, as_long, as_opt_bytes, as_string, get, non_null, optional,
    record,
};
use crate::iceberg::metadata::FORMAT_VERSION;
use crate::iceberg::types::{PrimitiveType, Value};

/// Inclusive bounds of one partition field across the files of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSummary {
    pub contains_null: bool,
    pub contains_nan: Option<bool>,
    pub lower_bound: Option<Vec<u8>>,
    pub upper_bound: Option<Vec<u8>>,
}

/// One manifest-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub manifest_path: String,
    pub manifest_length: i64,
    pub partition_spec_id: i32,
    /// 0 = data, 1 = deletes.
    pub content: i32,
    pub sequence_number: i64,
    pub min_sequence_number: i64,
    pub added_snapshot_id: i64,
    pub added_files_count: i32,
    pub existing_files_count: i32,
    pub deleted_files_count: i32,
    pub added_rows_count: i64,
    pub existing_rows_count: i64,
    pub deleted_rows_count: i64,
    pub partitions: Vec<FieldSummary>,
}

/// Per partition field: null/NaN presence and min/max over non-null values.
pub fn summarize_partitions<'a>(
    partition_types: &[PrimitiveType],
    partitions: impl Iterator<Item = &'a [Value]>,
) -> Vec<FieldSummary> {
    struct Acc {
        contains_null: bool,
        contains_nan: bool,
        lower: Option<Value>,
        upper: Option<Value>,
    }

    let mut accs: Vec<Acc> = partition_types
        .iter()
        .map(|_| Acc {
            contains_null: false,
            contains_nan: false,
            lower: None,
            upper: None,
        })
        .collect();

    for tuple in partitions {
        for (idx, acc) in accs.iter_mut().enumerate() {
            let value = tuple.get(idx).unwrap_or(&Value::Null);
            if value.is_null() {
                acc.contains_null = true;
                continue;
            }
            if value.is_nan() {
                acc.contains_nan = true;
                continue;
            }
            if acc
                .lower
                .as_ref()
                .map_or(true, |l| value.compare(l) == Some(std::cmp::Ordering::Less))
            {
                acc.lower = Some(value.clone());
            }
            if acc
                .upper
                .as_ref()
                .map_or(true, |u| value.compare(u) == Some(std::cmp::Ordering::Greater))
            {
                acc.upper = Some(value.clone());
            }
        }
    }

    accs.into_iter()
        .zip(partition_types.iter())
        .map(|(acc, ty)| FieldSummary {
            contains_null: acc.contains_null,
            contains_nan: if ty.is_floating() {
                Some(acc.contains_nan)
            } else {
                None
            },
            lower_bound: acc.lower.and_then(|v| v.to_bound_bytes(ty)),
            upper_bound: acc.upper.and_then(|v| v.to_bound_bytes(ty)),
        })
        .collect()
}

/// Exact Avro schema text of a format-version 2 manifest list.
pub fn manifest_list_schema_text() -> String {
    json!({
        "type": "record",
        "name": "manifest_file",
        "fields": [
            {"name": "manifest_path", "type": "string", "doc": "Location URI with FS scheme", "field-id": 500},
            {"name": "manifest_length", "type": "long", "doc": "Total file size in bytes", "field-id": 501},
            {"name": "partition_spec_id", "type": "int", "doc": "Spec ID used to write", "field-id": 502},
            {"name": "content", "type": "int", "doc": "Contents of the manifest: 0=data, 1=deletes", "field-id": 517},
            {"name": "sequence_number", "type": "long", "doc": "Sequence number when the manifest was added", "field-id": 515},
            {"name": "min_sequence_number", "type": "long", "doc": "Lowest sequence number in the manifest", "field-id": 516},
            {"name": "added_snapshot_id", "type": "long", "doc": "Snapshot ID that added the manifest", "field-id": 503},
            {"name": "added_files_count", "type": "int", "doc": "Added entry count", "field-id": 504},
            {"name": "existing_files_count", "type": "int", "doc": "Existing entry count", "field-id": 505},
            {"name": "deleted_files_count", "type": "int", "doc": "Deleted entry count", "field-id": 506},
            {"name": "added_rows_count", "type": "long", "doc": "Added rows count", "field-id": 512},
            {"name": "existing_rows_count", "type": "long", "doc": "Existing rows count", "field-id": 513},
            {"name": "deleted_rows_count", "type": "long", "doc": "Deleted rows count", "field-id": 514},
            {
                "name": "partitions",
                "type": ["null", {
                    "type": "array",
                    "items": {
                        "type": "record",
                        "name": "r508",
                        "fields": [
                            {"name": "contains_null", "type": "boolean", "doc": "True if any file has a null partition value", "field-id": 509},
                            {"name": "contains_nan", "type": ["null", "boolean"], "doc": "True if any file has a nan partition value", "default": null, "field-id": 518},
                            {"name": "lower_bound", "type": ["null", "bytes"], "doc": "Partition lower bound for all files", "default": null, "field-id": 510},
                            {"name": "upper_bound", "type": ["null", "bytes"], "doc": "Partition upper bound for all files", "default": null, "field-id": 511}
                        ]
                    },
                    "element-id": 508
                }],
                "doc": "Summary for each partition",
                "default": null,
                "field-id": 507
            },
            {"name": "key_metadata", "type": ["null", "bytes"], "doc": "Encryption key metadata blob", "default": null, "field-id": 519}
        ]
    })
    .to_string()
}

fn manifest_file_to_avro(m: &ManifestFile) -> AvroValue {
    let partitions = AvroValue::Array(
        m.partitions
            .iter()
            .map(|p| {
                record(vec![
                    ("contains_null", AvroValue::Boolean(p.contains_null)),
                    ("contains_nan", optional(p.contains_nan.map(AvroValue::Boolean))),
                    ("lower_bound", optional(p.lower_bound.clone().map(AvroValue::Bytes))),
                    ("upper_bound", optional(p.upper_bound.clone().map(AvroValue::Bytes))),
                ])
            })
            .collect(),
    );

    record(vec![
        ("manifest_path", AvroValue::String(m.manifest_path.clone())),
        ("manifest_length", AvroValue::Long(m.manifest_length)),
        ("partition_spec_id", AvroValue::Int(m.partition_spec_id)),
        ("content", AvroValue::Int(m.content)),
        ("sequence_number", AvroValue::Long(m.sequence_number)),
        ("min_sequence_number", AvroValue::Long(m.min_sequence_number)),
        ("added_snapshot_id", AvroValue::Long(m.added_snapshot_id)),
        ("added_files_count", AvroValue::Int(m.added_files_count)),
        ("existing_files_count", AvroValue::Int(m.existing_files_count)),
        ("deleted_files_count", AvroValue::Int(m.deleted_files_count)),
        ("added_rows_count", AvroValue::Long(m.added_rows_count)),
        ("existing_rows_count", AvroValue::Long(m.existing_rows_count)),
        ("deleted_rows_count", AvroValue::Long(m.deleted_rows_count)),
        ("partitions", optional(Some(partitions))),
        ("key_metadata", optional(None)),
    ])
}

/// Writes the manifest list of one snapshot.
pub struct ManifestListWriter {
    snapshot_id: i64,
    parent_snapshot_id: Option<i64>,
    sequence_number: i64,
}

impl ManifestListWriter {
    pub fn new(snapshot_id: i64, parent_snapshot_id: Option<i64>, sequence_number: i64) -> Self {
        Self {
            snapshot_id,
            parent_snapshot_id,
            sequence_number,
        }
    }

    /// Write `manifests` (carried-forward entries first, then the new one) to `path`.
    pub fn write(&self, path: &Path, manifests: &[ManifestFile]) -> Result<()> {
        let metadata = [
            ("snapshot-id", self.snapshot_id.to_string()),
            (
                "parent-snapshot-id",
                self.parent_snapshot_id
                    .map_or_else(|| "null".to_string(), |id| id.to_string()),
            ),
            ("sequence-number", self.sequence_number.to_string()),
            ("format-version", FORMAT_VERSION.to_string()),
        ];
        let records = manifests.iter().map(manifest_file_to_avro).collect();
        let bytes = avro::write_container(&manifest_list_schema_text(), &metadata, records)?;
        crate::utils::write_atomic(path, &bytes)?;

        tracing::debug!(
            "Wrote manifest list {} with {} manifests",
            path.display(),
            manifests.len()
        );
        Ok(())
    }
}

/// Read every entry of a manifest list.
pub fn read_manifest_list(path: &Path) -> Result<Vec<ManifestFile>> {
    let bytes = std::fs::read(path).map_err(|e| ReplicatorError::io(path, e))?;
    let (records, _) = avro::read_container(&bytes)?;

    records
        .iter()
        .map(|rec| {
            let partitions = as_array(get(rec, "partitions")?)?
                .iter()
                .map(|p| {
                    Ok(FieldSummary {
                        contains_null: as_bool(get(p, "contains_null")?)?,
                        contains_nan: non_null(get(p, "contains_nan")?)
                            .map(as_bool)
                            .transpose()?,
                        lower_bound: as_opt_bytes(get(p, "lower_bound")?)?,
                        upper_bound: as_opt_bytes(get(p, "upper_bound")?)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(ManifestFile {
                manifest_path: as_string(get(rec, "manifest_path")?)?,
                manifest_length: as_long(get(rec, "manifest_length")?)?,
                partition_spec_id: as_int(get(rec, "partition_spec_id")?)?,
                content: as_int(get(rec, "content")?)?,
                sequence_number: as_long(get(rec, "sequence_number")?)?,
                min_sequence_number: as_long(get(rec, "min_sequence_number")?)?,
                added_snapshot_id: as_long(get(rec, "added_snapshot_id")?)?,
                added_files_count: as_int(get(rec, "added_files_count")?)?,
                existing_files_count: as_int(get(rec, "existing_files_count")?)?,
                deleted_files_count: as_int(get(rec, "deleted_files_count")?)?,
                added_rows_count: as_long(get(rec, "added_rows_count")?)?,
                existing_rows_count: as_long(get(rec, "existing_rows_count")?)?,
                deleted_rows_count: as_long(get(rec, "deleted_rows_count")?)?,
                partitions,
            })
        })
        .collect()
}
