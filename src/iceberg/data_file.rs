// ABOUTME: ColumnarFileWriter - streams rows into rolling Parquet data files with field ids
// ABOUTME: Accumulates per-column statistics during the write for manifest entries

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::Schema as ArrowSchema;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use uuid::Uuid;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::arrow::{record_batch_to_rows, rows_to_record_batch, schema_to_arrow};
use crate::iceberg::metadata::PartitionSpec;
use crate::iceberg::types::{PrimitiveType, Row, TableSchema, Value};

/// Key-value metadata key holding the table schema JSON in every data file.
pub const SCHEMA_METADATA_KEY: &str = "iceberg.schema";

/// Thresholds controlling batching and file rolling.
#[derive(Debug, Clone)]
pub struct DataFileWriterConfig {
    /// Roll to a new file once this many rows were written to the current one.
    pub target_file_rows: u64,
    /// Roll to a new file once the current one reaches roughly this many bytes.
    pub target_file_bytes: u64,
    /// Rows buffered before a record batch is handed to the Parquet writer.
    pub batch_rows: usize,
}

impl Default for DataFileWriterConfig {
    fn default() -> Self {
        Self {
            target_file_rows: 1_000_000,
            target_file_bytes: 128 * 1024 * 1024,
            batch_rows: 4096,
        }
    }
}

/// A finished, immutable data file and its statistics, keyed by field id.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFile {
    /// Absolute path of the Parquet file.
    pub file_path: String,
    pub file_format: String,
    /// Partition tuple in partition-spec field order (empty when unpartitioned).
    pub partition: Vec<Value>,
    pub record_count: i64,
    pub file_size_in_bytes: i64,
    pub column_sizes: BTreeMap<i32, i64>,
    pub value_counts: BTreeMap<i32, i64>,
    pub null_value_counts: BTreeMap<i32, i64>,
    pub nan_value_counts: BTreeMap<i32, i64>,
    pub lower_bounds: BTreeMap<i32, Vec<u8>>,
    pub upper_bounds: BTreeMap<i32, Vec<u8>>,
    pub split_offsets: Vec<i64>,
}

#[derive(Debug, Default, Clone)]
struct ColumnStats {
    values: i64,
    nulls: i64,
    nans: i64,
    lower: Option<Value>,
    upper: Option<Value>,
}

impl ColumnStats {
    fn observe(&mut self, value: &Value) {
        self.values += 1;
        if value.is_null() {
            self.nulls += 1;
            return;
        }
        if value.is_nan() {
            self.nans += 1;
            return;
        }
        let lower_is_greater = self
            .lower
            .as_ref()
            .map_or(true, |l| value.compare(l) == Some(std::cmp::Ordering::Less));
        if lower_is_greater {
            self.lower = Some(value.clone());
        }
        let upper_is_smaller = self
            .upper
            .as_ref()
            .map_or(true, |u| value.compare(u) == Some(std::cmp::Ordering::Greater));
        if upper_is_smaller {
            self.upper = Some(value.clone());
        }
    }
}

struct OpenFile {
    path: PathBuf,
    writer: ArrowWriter<File>,
    partition: Vec<Value>,
    rows: u64,
    stats: Vec<ColumnStats>,
}

/// Streams rows into Parquet files under a table's `data/` directory.
///
/// Files are created lazily, so a writer that never receives a row produces
/// no files. A partitioned writer starts a new file whenever the partition
/// tuple changes, so rows should arrive clustered by partition.
pub struct ColumnarFileWriter {
    data_dir: PathBuf,
    schema: TableSchema,
    /// Schema positions of the identity partition source columns, in spec order.
    partition_positions: Vec<usize>,
    arrow_schema: Arc<ArrowSchema>,
    properties: WriterProperties,
    config: DataFileWriterConfig,
    buffer: Vec<Row>,
    current: Option<OpenFile>,
    completed: Vec<DataFile>,
    rows_written: u64,
}

impl ColumnarFileWriter {
    pub fn new(data_dir: &Path, schema: &TableSchema, config: DataFileWriterConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| ReplicatorError::io(data_dir, e))?;

        let schema_json = serde_json::to_string(schema)?;
        let properties = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_key_value_metadata(Some(vec![KeyValue::new(
                SCHEMA_METADATA_KEY.to_string(),
                schema_json,
            )]))
            .build();

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            schema: schema.clone(),
            partition_positions: Vec::new(),
            arrow_schema: schema_to_arrow(schema),
            properties,
            buffer: Vec::with_capacity(config.batch_rows.max(1)),
            config,
            current: None,
            completed: Vec::new(),
            rows_written: 0,
        })
    }

    /// Fill each file's partition tuple from `spec` (identity transforms only).
    pub fn partitioned_by(mut self, spec: &PartitionSpec) -> Result<Self> {
        let mut positions = Vec::with_capacity(spec.fields.len());
        for field in &spec.fields {
            if field.transform != "identity" {
                return Err(ReplicatorError::InvalidData(format!(
                    "unsupported partition transform '{}'",
                    field.transform
                )));
            }
            let position = self
                .schema
                .fields
                .iter()
                .position(|f| f.id == field.source_id)
                .ok_or_else(|| {
                    ReplicatorError::InvalidData(format!(
                        "partition source field {} not in schema {}",
                        field.source_id, self.schema.schema_id
                    ))
                })?;
            positions.push(position);
        }
        self.partition_positions = positions;
        Ok(self)
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Total rows accepted so far across all files.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Append one row laid out in schema field order.
    pub fn write_row(&mut self, row: Row) -> Result<()> {
        self.validate(&row)?;

        let partition: Vec<Value> = self
            .partition_positions
            .iter()
            .map(|&i| row[i].clone())
            .collect();
        if self
            .current
            .as_ref()
            .is_some_and(|open| open.partition != partition)
        {
            self.flush_buffer()?;
            self.close_current()?;
        }
        if self.current.is_none() {
            self.current = Some(self.open_file(partition)?);
        }
        if let Some(open) = self.current.as_mut() {
            for (stats, value) in open.stats.iter_mut().zip(row.iter()) {
                stats.observe(value);
            }
            open.rows += 1;
        }
        self.buffer.push(row);
        self.rows_written += 1;

        let file_full = self
            .current
            .as_ref()
            .is_some_and(|open| open.rows >= self.config.target_file_rows);
        if self.buffer.len() >= self.config.batch_rows.max(1) || file_full {
            self.flush_buffer()?;
            if self.should_roll() {
                self.close_current()?;
            }
        }
        Ok(())
    }

    pub fn write_rows<I: IntoIterator<Item = Row>>(&mut self, rows: I) -> Result<()> {
        for row in rows {
            self.write_row(row)?;
        }
        Ok(())
    }

    /// Flush buffered rows, close the open file, and return every finished file.
    pub fn finish(mut self) -> Result<Vec<DataFile>> {
        self.flush_buffer()?;
        self.close_current()?;
        Ok(self.completed)
    }

    fn validate(&self, row: &Row) -> Result<()> {
        if row.len() != self.schema.fields.len() {
            return Err(ReplicatorError::InvalidData(format!(
                "row has {} values but schema has {} fields",
                row.len(),
                self.schema.fields.len()
            )));
        }
        for (field, value) in self.schema.fields.iter().zip(row.iter()) {
            if value.is_null() && field.required {
                return Err(ReplicatorError::InvalidData(format!(
                    "required column '{}' is null",
                    field.name
                )));
            }
            if !value.conforms_to(&field.field_type) {
                return Err(ReplicatorError::InvalidData(format!(
                    "column '{}' of type {} cannot hold value {}",
                    field.name, field.field_type, value
                )));
            }
        }
        Ok(())
    }

    fn open_file(&self, partition: Vec<Value>) -> Result<OpenFile> {
        let name = format!(
            "{:05}-0-{}.parquet",
            self.completed.len(),
            Uuid::new_v4()
        );
        let path = self.data_dir.join(name);
        let file = File::create(&path).map_err(|e| ReplicatorError::io(&path, e))?;
        let writer = ArrowWriter::try_new(
            file,
            self.arrow_schema.clone(),
            Some(self.properties.clone()),
        )?;
        tracing::debug!("Opened data file {}", path.display());
        Ok(OpenFile {
            path,
            writer,
            partition,
            rows: 0,
            stats: vec![ColumnStats::default(); self.schema.fields.len()],
        })
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };
        let rows = std::mem::take(&mut self.buffer);
        let batch = rows_to_record_batch(&self.schema, self.arrow_schema.clone(), &rows)?;
        open.writer.write(&batch)?;
        Ok(())
    }

    fn should_roll(&self) -> bool {
        match &self.current {
            Some(open) => {
                let approx_bytes = open.writer.bytes_written() + open.writer.in_progress_size();
                open.rows >= self.config.target_file_rows
                    || approx_bytes as u64 >= self.config.target_file_bytes
            }
            None => false,
        }
    }

    fn close_current(&mut self) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        let OpenFile {
            path,
            writer,
            partition,
            rows,
            stats,
        } = open;

        let file_metadata = writer.close()?;
        let file_size = std::fs::metadata(&path)
            .map_err(|e| ReplicatorError::io(&path, e))?
            .len();

        let ids_by_name: HashMap<&str, i32> = self
            .schema
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.id))
            .collect();

        let mut column_sizes = BTreeMap::new();
        let mut split_offsets = Vec::with_capacity(file_metadata.row_groups.len());
        for row_group in &file_metadata.row_groups {
            let mut first_offset: Option<i64> = None;
            for chunk in &row_group.columns {
                let Some(meta) = &chunk.meta_data else {
                    continue;
                };
                let offset = meta.dictionary_page_offset.unwrap_or(meta.data_page_offset);
                first_offset = Some(first_offset.map_or(offset, |o| o.min(offset)));
                if let Some(id) = meta
                    .path_in_schema
                    .first()
                    .and_then(|name| ids_by_name.get(name.as_str()))
                {
                    *column_sizes.entry(*id).or_insert(0) += meta.total_compressed_size;
                }
            }
            if let Some(offset) = row_group.file_offset.or(first_offset) {
                split_offsets.push(offset);
            }
        }
        split_offsets.sort_unstable();

        let mut data_file = DataFile {
            file_path: absolute_path_string(&path)?,
            file_format: "PARQUET".to_string(),
            partition,
            record_count: rows as i64,
            file_size_in_bytes: file_size as i64,
            column_sizes,
            value_counts: BTreeMap::new(),
            null_value_counts: BTreeMap::new(),
            nan_value_counts: BTreeMap::new(),
            lower_bounds: BTreeMap::new(),
            upper_bounds: BTreeMap::new(),
            split_offsets,
        };

        for (field, stats) in self.schema.fields.iter().zip(stats.iter()) {
            data_file.value_counts.insert(field.id, stats.values);
            data_file.null_value_counts.insert(field.id, stats.nulls);
            if field.field_type.is_floating() {
                data_file.nan_value_counts.insert(field.id, stats.nans);
            }
            if let Some(lower) = stats.lower.as_ref().and_then(|v| v.to_bound_bytes(&field.field_type)) {
                data_file.lower_bounds.insert(field.id, lower);
            }
            if let Some(upper) = stats.upper.as_ref().and_then(|v| v.to_bound_bytes(&field.field_type)) {
                data_file.upper_bounds.insert(field.id, upper);
            }
        }

        tracing::debug!(
            "Closed data file {} ({} rows, {} bytes)",
            data_file.file_path,
            data_file.record_count,
            data_file.file_size_in_bytes
        );
        self.completed.push(data_file);
        Ok(())
    }
}

fn absolute_path_string(path: &Path) -> Result<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ReplicatorError::io(path, e))?
            .join(path)
    };
    Ok(absolute.to_string_lossy().into_owned())
}

/// Read every row of a data file, resolving columns by field id against `schema`.
pub fn read_data_file(path: &Path, schema: &TableSchema) -> Result<Vec<Row>> {
    let file = File::open(path).map_err(|e| ReplicatorError::io(path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        rows.extend(record_batch_to_rows(schema, &batch)?);
    }
    Ok(rows)
}

/// Decode the lower/upper bound of a field back into a value (used by inspection tooling).
pub fn decode_bound(ty: &PrimitiveType, bytes: Option<&Vec<u8>>) -> Result<Option<Value>> {
    bytes.map(|b| Value::from_bound_bytes(ty, b)).transpose()
}
