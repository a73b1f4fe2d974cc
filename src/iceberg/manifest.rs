// ABOUTME: ManifestWriter - records one added entry per data file in an Avro manifest
// ABOUTME: Schema text carries field ids for every nested field, key and element

use std::collections::BTreeSet;
use std::path::Path;

use apache_avro::types::Value as AvroValue;
use serde_json::json;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::avro::{
    self, as_array, as_int, as_long, as_opt_long, as_string, get, int_bytes_map, int_long_map,
    optional, read_int_bytes_map, read_int_long_map, record,
};
use crate::iceberg::data_file::DataFile;
use crate::iceberg::manifest_list::{summarize_partitions, ManifestFile};
use crate::iceberg::metadata::{PartitionSpec, FORMAT_VERSION};
use crate::iceberg::types::{
    date_from_days, days_from_epoch, time_from_micros, time_micros, timestamp_from_micros,
    timestamptz_from_micros, PrimitiveType, TableSchema, Value,
};

/// Entry status within a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestStatus {
    Existing = 0,
    Added = 1,
    Deleted = 2,
}

impl TryFrom<i32> for ManifestStatus {
    type Error = ReplicatorError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ManifestStatus::Existing),
            1 => Ok(ManifestStatus::Added),
            2 => Ok(ManifestStatus::Deleted),
            other => Err(ReplicatorError::InvalidData(format!(
                "unknown manifest entry status {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub status: ManifestStatus,
    pub snapshot_id: Option<i64>,
    pub sequence_number: Option<i64>,
    pub file_sequence_number: Option<i64>,
    pub data_file: DataFile,
}

fn map_type(key_id: i32, value_id: i32, value_type: &str) -> serde_json::Value {
    json!({
        "type": "array",
        "items": {
            "type": "record",
            "name": format!("k{}_v{}", key_id, value_id),
            "fields": [
                {"name": "key", "type": "int", "field-id": key_id},
                {"name": "value", "type": value_type, "field-id": value_id}
            ]
        },
        "logicalType": "map"
    })
}

fn optional_field(name: &str, ty: serde_json::Value, field_id: i32, doc: &str) -> serde_json::Value {
    json!({"name": name, "type": ["null", ty], "doc": doc, "default": null, "field-id": field_id})
}

/// Avro base type used for a partition value of the given table type.
fn partition_avro_type(ty: &PrimitiveType) -> &'static str {
    match ty {
        PrimitiveType::Boolean => "boolean",
        PrimitiveType::Int | PrimitiveType::Date => "int",
        PrimitiveType::Long
        | PrimitiveType::Time
        | PrimitiveType::Timestamp
        | PrimitiveType::Timestamptz => "long",
        PrimitiveType::Float => "float",
        PrimitiveType::Double => "double",
        PrimitiveType::String => "string",
        PrimitiveType::Decimal { .. }
        | PrimitiveType::Uuid
        | PrimitiveType::Fixed(_)
        | PrimitiveType::Binary => "bytes",
    }
}

fn partition_to_avro(value: &Value, ty: &PrimitiveType) -> Option<AvroValue> {
    let avro = match value {
        Value::Null => return None,
        Value::Boolean(b) => AvroValue::Boolean(*b),
        Value::Int(i) => AvroValue::Int(*i),
        Value::Long(l) => AvroValue::Long(*l),
        Value::Float(f) => AvroValue::Float(*f),
        Value::Double(d) => AvroValue::Double(*d),
        Value::Date(d) => AvroValue::Int(days_from_epoch(d)),
        Value::Time(t) => AvroValue::Long(time_micros(t)),
        Value::Timestamp(ts) => AvroValue::Long(ts.and_utc().timestamp_micros()),
        Value::Timestamptz(ts) => AvroValue::Long(ts.timestamp_micros()),
        Value::String(s) => AvroValue::String(s.clone()),
        other => AvroValue::Bytes(other.to_bound_bytes(ty)?),
    };
    Some(avro)
}

fn partition_from_avro(value: &AvroValue, ty: &PrimitiveType) -> Result<Value> {
    let Some(inner) = avro::non_null(value) else {
        return Ok(Value::Null);
    };
    let unexpected = || {
        ReplicatorError::InvalidData(format!(
            "partition value {:?} does not match type {}",
            inner, ty
        ))
    };
    let value = match (ty, inner) {
        (PrimitiveType::Boolean, AvroValue::Boolean(b)) => Value::Boolean(*b),
        (PrimitiveType::Int, AvroValue::Int(i)) => Value::Int(*i),
        (PrimitiveType::Date, AvroValue::Int(i)) => date_from_days(*i)?,
        (PrimitiveType::Long, AvroValue::Long(l)) => Value::Long(*l),
        (PrimitiveType::Time, AvroValue::Long(l)) => time_from_micros(*l)?,
        (PrimitiveType::Timestamp, AvroValue::Long(l)) => timestamp_from_micros(*l)?,
        (PrimitiveType::Timestamptz, AvroValue::Long(l)) => timestamptz_from_micros(*l)?,
        (PrimitiveType::Float, AvroValue::Float(f)) => Value::Float(*f),
        (PrimitiveType::Double, AvroValue::Double(d)) => Value::Double(*d),
        (PrimitiveType::String, AvroValue::String(s)) => Value::String(s.clone()),
        (_, AvroValue::Bytes(b)) => Value::from_bound_bytes(ty, b)?,
        _ => return Err(unexpected()),
    };
    Ok(value)
}

/// Exact Avro schema text of a format-version 2 manifest entry.
pub fn manifest_schema_text(spec: &PartitionSpec, partition_types: &[PrimitiveType]) -> String {
    let partition_fields: Vec<serde_json::Value> = spec
        .fields
        .iter()
        .zip(partition_types.iter())
        .map(|(pf, ty)| {
            json!({
                "name": pf.name,
                "type": ["null", partition_avro_type(ty)],
                "default": null,
                "field-id": pf.field_id
            })
        })
        .collect();

    let data_file = json!({
        "type": "record",
        "name": "r2",
        "fields": [
            {"name": "content", "type": "int", "doc": "Contents of the file: 0=data, 1=position deletes, 2=equality deletes", "field-id": 134},
            {"name": "file_path", "type": "string", "doc": "Location URI with FS scheme", "field-id": 100},
            {"name": "file_format", "type": "string", "doc": "File format name: avro, orc, or parquet", "field-id": 101},
            {"name": "partition", "type": {"type": "record", "name": "r102", "fields": partition_fields}, "doc": "Partition data tuple, schema based on the partition spec", "field-id": 102},
            {"name": "record_count", "type": "long", "doc": "Number of records in the file", "field-id": 103},
            {"name": "file_size_in_bytes", "type": "long", "doc": "Total file size in bytes", "field-id": 104},
            optional_field("column_sizes", map_type(117, 118, "long"), 108, "Map of column id to total size on disk"),
            optional_field("value_counts", map_type(119, 120, "long"), 109, "Map of column id to total count, including null and NaN"),
            optional_field("null_value_counts", map_type(121, 122, "long"), 110, "Map of column id to null value count"),
            optional_field("nan_value_counts", map_type(138, 139, "long"), 137, "Map of column id to number of NaN values in the column"),
            optional_field("lower_bounds", map_type(126, 127, "bytes"), 125, "Map of column id to lower bound"),
            optional_field("upper_bounds", map_type(129, 130, "bytes"), 128, "Map of column id to upper bound"),
            optional_field("key_metadata", json!("bytes"), 131, "Encryption key metadata blob"),
            optional_field("split_offsets", json!({"type": "array", "items": "long", "element-id": 133}), 132, "Splittable offsets"),
            optional_field("equality_ids", json!({"type": "array", "items": "int", "element-id": 136}), 135, "Equality comparison field IDs"),
            optional_field("sort_order_id", json!("int"), 140, "Sort order ID")
        ]
    });

    json!({
        "type": "record",
        "name": "manifest_entry",
        "fields": [
            {"name": "status", "type": "int", "field-id": 0},
            {"name": "snapshot_id", "type": ["null", "long"], "default": null, "field-id": 1},
            {"name": "sequence_number", "type": ["null", "long"], "default": null, "field-id": 3},
            {"name": "file_sequence_number", "type": ["null", "long"], "default": null, "field-id": 4},
            {"name": "data_file", "type": data_file, "field-id": 2}
        ]
    })
    .to_string()
}

fn entry_to_avro(entry: &ManifestEntry, partition_types: &[PrimitiveType], spec: &PartitionSpec) -> AvroValue {
    let df = &entry.data_file;
    let partition = record(
        spec.fields
            .iter()
            .zip(partition_types.iter())
            .enumerate()
            .map(|(idx, (pf, ty))| {
                let value = df.partition.get(idx).unwrap_or(&Value::Null);
                (pf.name.as_str(), optional(partition_to_avro(value, ty)))
            })
            .collect(),
    );

    let data_file = record(vec![
        ("content", AvroValue::Int(0)),
        ("file_path", AvroValue::String(df.file_path.clone())),
        ("file_format", AvroValue::String(df.file_format.clone())),
        ("partition", partition),
        ("record_count", AvroValue::Long(df.record_count)),
        ("file_size_in_bytes", AvroValue::Long(df.file_size_in_bytes)),
        ("column_sizes", optional(Some(int_long_map(&df.column_sizes)))),
        ("value_counts", optional(Some(int_long_map(&df.value_counts)))),
        ("null_value_counts", optional(Some(int_long_map(&df.null_value_counts)))),
        ("nan_value_counts", optional(Some(int_long_map(&df.nan_value_counts)))),
        ("lower_bounds", optional(Some(int_bytes_map(&df.lower_bounds)))),
        ("upper_bounds", optional(Some(int_bytes_map(&df.upper_bounds)))),
        ("key_metadata", optional(None)),
        (
            "split_offsets",
            optional(Some(AvroValue::Array(
                df.split_offsets.iter().map(|o| AvroValue::Long(*o)).collect(),
            ))),
        ),
        ("equality_ids", optional(None)),
        ("sort_order_id", optional(Some(AvroValue::Int(0)))),
    ]);

    record(vec![
        ("status", AvroValue::Int(entry.status as i32)),
        ("snapshot_id", optional(entry.snapshot_id.map(AvroValue::Long))),
        ("sequence_number", optional(entry.sequence_number.map(AvroValue::Long))),
        (
            "file_sequence_number",
            optional(entry.file_sequence_number.map(AvroValue::Long)),
        ),
        ("data_file", data_file),
    ])
}

/// Writes the manifest for the data files added by one snapshot.
pub struct ManifestWriter<'a> {
    schema: &'a TableSchema,
    spec: &'a PartitionSpec,
    snapshot_id: i64,
    sequence_number: i64,
}

impl<'a> ManifestWriter<'a> {
    pub fn new(
        schema: &'a TableSchema,
        spec: &'a PartitionSpec,
        snapshot_id: i64,
        sequence_number: i64,
    ) -> Self {
        Self {
            schema,
            spec,
            snapshot_id,
            sequence_number,
        }
    }

    /// Write one `added` entry per data file to `path` and describe the result
    /// as a manifest-list entry.
    pub fn write(&self, path: &Path, data_files: &[DataFile]) -> Result<ManifestFile> {
        let partition_types = self.spec.partition_types(self.schema)?;
        let schema_text = manifest_schema_text(self.spec, &partition_types);

        let entries: Vec<ManifestEntry> = data_files
            .iter()
            .map(|df| ManifestEntry {
                status: ManifestStatus::Added,
                snapshot_id: Some(self.snapshot_id),
                sequence_number: Some(self.sequence_number),
                file_sequence_number: Some(self.sequence_number),
                data_file: df.clone(),
            })
            .collect();
        let records = entries
            .iter()
            .map(|e| entry_to_avro(e, &partition_types, self.spec))
            .collect();

        let metadata = [
            ("schema", serde_json::to_string(self.schema)?),
            ("schema-id", self.schema.schema_id.to_string()),
            ("partition-spec", serde_json::to_string(&self.spec.fields)?),
            ("partition-spec-id", self.spec.spec_id.to_string()),
            ("format-version", FORMAT_VERSION.to_string()),
            ("content", "data".to_string()),
        ];
        let bytes = avro::write_container(&schema_text, &metadata, records)?;
        crate::utils::write_atomic(path, &bytes)?;

        tracing::debug!(
            "Wrote manifest {} with {} entries",
            path.display(),
            entries.len()
        );

        let partitions = summarize_partitions(
            &partition_types,
            data_files.iter().map(|df| df.partition.as_slice()),
        );
        Ok(ManifestFile {
            manifest_path: path.to_string_lossy().into_owned(),
            manifest_length: bytes.len() as i64,
            partition_spec_id: self.spec.spec_id,
            content: 0,
            sequence_number: self.sequence_number,
            min_sequence_number: self.sequence_number,
            added_snapshot_id: self.snapshot_id,
            added_files_count: data_files.len() as i32,
            existing_files_count: 0,
            deleted_files_count: 0,
            added_rows_count: data_files.iter().map(|f| f.record_count).sum(),
            existing_rows_count: 0,
            deleted_rows_count: 0,
            partitions,
        })
    }
}

/// Read every entry of a manifest. `partition_types` decodes partition tuples.
pub fn read_manifest(path: &Path, partition_types: &[PrimitiveType]) -> Result<Vec<ManifestEntry>> {
    let bytes = std::fs::read(path).map_err(|e| ReplicatorError::io(path, e))?;
    let (records, _) = avro::read_container(&bytes)?;

    let mut entries = Vec::with_capacity(records.len());
    for rec in &records {
        let df = get(rec, "data_file")?;

        let partition = match get(df, "partition")? {
            AvroValue::Record(fields) => fields
                .iter()
                .zip(partition_types.iter())
                .map(|((_, v), ty)| partition_from_avro(v, ty))
                .collect::<Result<Vec<Value>>>()?,
            _ => Vec::new(),
        };

        let split_offsets = as_array(get(df, "split_offsets")?)?
            .iter()
            .map(as_long)
            .collect::<Result<Vec<i64>>>()?;

        let data_file = DataFile {
            file_path: as_string(get(df, "file_path")?)?,
            file_format: as_string(get(df, "file_format")?)?,
            partition,
            record_count: as_long(get(df, "record_count")?)?,
            file_size_in_bytes: as_long(get(df, "file_size_in_bytes")?)?,
            column_sizes: read_int_long_map(get(df, "column_sizes")?)?,
            value_counts: read_int_long_map(get(df, "value_counts")?)?,
            null_value_counts: read_int_long_map(get(df, "null_value_counts")?)?,
            nan_value_counts: read_int_long_map(get(df, "nan_value_counts")?)?,
            lower_bounds: read_int_bytes_map(get(df, "lower_bounds")?)?,
            upper_bounds: read_int_bytes_map(get(df, "upper_bounds")?)?,
            split_offsets,
        };

        entries.push(ManifestEntry {
            status: ManifestStatus::try_from(as_int(get(rec, "status")?)?)?,
            snapshot_id: as_opt_long(get(rec, "snapshot_id")?)?,
            sequence_number: as_opt_long(get(rec, "sequence_number")?)?,
            file_sequence_number: as_opt_long(get(rec, "file_sequence_number")?)?,
            data_file,
        });
    }
    Ok(entries)
}

/// Field ids referenced by the statistics of a data file.
pub fn referenced_field_ids(data_file: &DataFile) -> Vec<i32> {
    data_file
        .value_counts
        .keys()
        .chain(data_file.column_sizes.keys())
        .chain(data_file.null_value_counts.keys())
        .chain(data_file.nan_value_counts.keys())
        .chain(data_file.lower_bounds.keys())
        .chain(data_file.upper_bounds.keys())
        .copied()
        .collect::<BTreeSet<i32>>()
        .into_iter()
        .collect()
}
