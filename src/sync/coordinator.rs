// ABOUTME: IncrementalSyncCoordinator - one detect, extract, commit, merge, advance cycle
// ABOUTME: Watermarks only move after the destination merge succeeds

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{ReplicatorError, Result};
use crate::iceberg::catalog::{LoadedTable, PendingCommit, SchemaUpdate, TableCatalog};
use crate::iceberg::data_file::{ColumnarFileWriter, DataFile, DataFileWriterConfig};
use crate::iceberg::schema::{SchemaTranslation, SchemaTranslator, SourceColumn};
use crate::sync::change_detection::{ChangeDetectionKind, ChangeDetectionStrategy};
use crate::sync::sink::DestinationSink;
use crate::sync::source::RowSource;
use crate::sync::watermark::{WatermarkStore, WatermarkValue};
use crate::utils::sanitize_identifier;

/// How committed rows are applied to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Insert or replace by primary key; re-running a cycle is harmless.
    #[default]
    Upsert,
    /// Insert only. A cycle retried after a failed watermark write duplicates rows.
    Append,
}

impl std::str::FromStr for MergeStrategy {
    type Err = ReplicatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upsert" => Ok(MergeStrategy::Upsert),
            "append" => Ok(MergeStrategy::Append),
            other => Err(ReplicatorError::Config(format!(
                "unknown merge strategy '{}' (expected upsert or append)",
                other
            ))),
        }
    }
}

/// Per-table settings for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Table-format table name; also the watermark key.
    pub table: String,
    pub primary_key: Vec<String>,
    pub watermark_column: String,
    pub merge_strategy: MergeStrategy,
    pub change_detection: ChangeDetectionKind,
    pub writer: DataFileWriterConfig,
}

impl CoordinatorConfig {
    pub fn new(table: &str, watermark_column: &str, primary_key: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
            watermark_column: watermark_column.to_string(),
            merge_strategy: MergeStrategy::default(),
            change_detection: ChangeDetectionKind::default(),
            writer: DataFileWriterConfig::default(),
        }
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub table: String,
    pub rows_extracted: u64,
    pub rows_applied: u64,
    pub snapshot_id: Option<i64>,
    /// Watermark in effect after the cycle
    pub watermark: Option<WatermarkValue>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CycleResult {
    pub fn is_success(&self) -> bool {
        self.success
    }
}

#[derive(Debug, Default)]
struct CycleOutcome {
    rows_extracted: u64,
    rows_applied: u64,
    snapshot_id: Option<i64>,
    watermark: Option<WatermarkValue>,
}

/// Drives incremental syncs of one table through a catalog.
pub struct IncrementalSyncCoordinator<C: TableCatalog> {
    catalog: C,
    store: WatermarkStore,
    strategy: Box<dyn ChangeDetectionStrategy>,
    config: CoordinatorConfig,
}

impl<C: TableCatalog> IncrementalSyncCoordinator<C> {
    pub fn new(catalog: C, store: WatermarkStore, config: CoordinatorConfig) -> Result<Self> {
        if config.merge_strategy == MergeStrategy::Upsert && config.primary_key.is_empty() {
            return Err(ReplicatorError::Config(format!(
                "table '{}' uses upsert but has no primary key",
                config.table
            )));
        }
        if config.watermark_column.is_empty() {
            return Err(ReplicatorError::Config(format!(
                "table '{}' has no watermark column",
                config.table
            )));
        }
        let strategy = config.change_detection.strategy(&config.watermark_column);
        Ok(Self {
            catalog,
            store,
            strategy,
            config,
        })
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }

    /// Run one cycle. Failures are reported in the result, never panicked or propagated.
    pub fn run_cycle(&self, source: &dyn RowSource, sink: &mut dyn DestinationSink) -> CycleResult {
        let start = Instant::now();
        let table = self.config.table.clone();
        tracing::info!(
            "Starting sync cycle for '{}' from source table '{}'",
            sanitize_identifier(&table),
            sanitize_identifier(source.table())
        );

        match self.try_cycle(source, sink) {
            Ok(outcome) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                tracing::info!(
                    "Sync cycle for '{}' completed: {} rows extracted, {} applied, snapshot {:?} in {}ms",
                    sanitize_identifier(&table),
                    outcome.rows_extracted,
                    outcome.rows_applied,
                    outcome.snapshot_id,
                    duration_ms
                );
                CycleResult {
                    table,
                    rows_extracted: outcome.rows_extracted,
                    rows_applied: outcome.rows_applied,
                    snapshot_id: outcome.snapshot_id,
                    watermark: outcome.watermark,
                    success: true,
                    error: None,
                    duration_ms,
                }
            }
            Err(e) => {
                tracing::error!(
                    "Sync cycle for '{}' failed ({}): {}",
                    sanitize_identifier(&table),
                    e.kind(),
                    e
                );
                let watermark = self
                    .store
                    .get(&table)
                    .ok()
                    .flatten()
                    .map(|w| w.value);
                CycleResult {
                    table,
                    rows_extracted: 0,
                    rows_applied: 0,
                    snapshot_id: None,
                    watermark,
                    success: false,
                    error: Some(e.to_string()),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }

    fn try_cycle(
        &self,
        source: &dyn RowSource,
        sink: &mut dyn DestinationSink,
    ) -> Result<CycleOutcome> {
        let name = self.config.table.as_str();

        let previous = match self.store.get(name)? {
            Some(stored) if stored.column != self.config.watermark_column => {
                return Err(ReplicatorError::Config(format!(
                    "stored watermark for '{}' tracks column '{}', not '{}'; reset it to re-sync",
                    name, stored.column, self.config.watermark_column
                )));
            }
            Some(stored) => Some(stored.value),
            None => None,
        };
        let predicate = self.strategy.boundary_predicate(previous.as_ref())?;
        tracing::debug!("Extraction predicate for '{}': {:?}", name, predicate);

        let columns = source.columns()?;
        let (table, translation) = self.load_or_create(&columns)?;
        let watermark_idx = translation
            .schema
            .index_of(&self.config.watermark_column)
            .ok_or_else(|| {
                ReplicatorError::Config(format!(
                    "watermark column '{}' not found in source table '{}'",
                    self.config.watermark_column,
                    source.table()
                ))
            })?;

        let (data_files, rows_extracted, next_watermark) =
            self.write_extracted(source, &predicate, &table, &translation, watermark_idx, previous)?;

        if rows_extracted == 0 {
            tracing::info!("No changes for '{}' since {:?}", name, previous);
            return Ok(CycleOutcome {
                watermark: previous,
                ..Default::default()
            });
        }

        let committed = self.commit_with_retry(&table, &columns, &translation, data_files)?;
        let snapshot_id = committed.current_snapshot_id().ok_or_else(|| {
            ReplicatorError::InvalidData(format!("commit to '{}' produced no snapshot", name))
        })?;

        let rows = self.catalog.read_snapshot_rows(&committed, snapshot_id)?;
        let schema = committed.current_schema()?;
        sink.prepare(schema, &self.config.primary_key)?;
        let rows_applied = match self.config.merge_strategy {
            MergeStrategy::Upsert => sink.apply_upsert(schema, &rows, &self.config.primary_key)?,
            MergeStrategy::Append => sink.apply_append(schema, &rows)?,
        };

        let watermark = match next_watermark {
            Some(value) => {
                self.store
                    .set(name, &self.config.watermark_column, value)?;
                Some(value)
            }
            None => previous,
        };

        Ok(CycleOutcome {
            rows_extracted,
            rows_applied,
            snapshot_id: Some(snapshot_id),
            watermark,
        })
    }

    fn load_or_create(&self, columns: &[SourceColumn]) -> Result<(LoadedTable, SchemaTranslation)> {
        let name = self.config.table.as_str();
        if self.catalog.exists(name) {
            let table = self.catalog.load(name)?;
            let translation = SchemaTranslator::translate(columns, Some(&table.metadata))?;
            Ok((table, translation))
        } else {
            let mut translation = SchemaTranslator::translate(columns, None)?;
            let table = self.catalog.create(name, translation.schema.clone())?;
            // The new table already carries the schema.
            translation.changed = false;
            Ok((table, translation))
        }
    }

    /// Stream matching rows into data files; returns the files, row count and next watermark.
    fn write_extracted(
        &self,
        source: &dyn RowSource,
        predicate: &crate::sync::change_detection::ExtractionPredicate,
        table: &LoadedTable,
        translation: &SchemaTranslation,
        watermark_idx: usize,
        previous: Option<WatermarkValue>,
    ) -> Result<(Vec<DataFile>, u64, Option<WatermarkValue>)> {
        let schema = &translation.schema;
        let mut writer =
            ColumnarFileWriter::new(&table.data_dir(), schema, self.config.writer.clone())?
                .partitioned_by(table.metadata.default_partition_spec()?)?;
        let mut next_watermark = previous;

        for row in source.extract(predicate)? {
            let row = row?;
            if row.len() != schema.fields.len() {
                return Err(ReplicatorError::Extraction {
                    table: source.table().to_string(),
                    message: format!(
                        "row has {} values, expected {}",
                        row.len(),
                        schema.fields.len()
                    ),
                });
            }
            let row = row
                .into_iter()
                .zip(&schema.fields)
                .map(|(value, field)| value.coerce_to(&field.field_type))
                .collect::<Result<Vec<_>>>()?;
            next_watermark = self
                .strategy
                .next_watermark(next_watermark, std::slice::from_ref(&row[watermark_idx]))?;
            writer.write_row(row)?;
        }

        let rows = writer.rows_written();
        let files = writer.finish()?;
        tracing::debug!(
            "Wrote {} rows into {} data files for '{}'",
            rows,
            files.len(),
            table.name
        );
        Ok((files, rows, next_watermark))
    }

    /// Commit, retrying once against the refreshed table on a conflict.
    fn commit_with_retry(
        &self,
        table: &LoadedTable,
        columns: &[SourceColumn],
        translation: &SchemaTranslation,
        data_files: Vec<DataFile>,
    ) -> Result<LoadedTable> {
        let pending = PendingCommit {
            data_files: data_files.clone(),
            schema_update: schema_update(translation),
        };
        match self.catalog.commit(table, pending) {
            Err(e) if e.is_retryable() => {
                tracing::warn!("{}; reloading and retrying once", e);
                let refreshed = self.catalog.load(&table.name)?;
                let retranslated = SchemaTranslator::translate(columns, Some(&refreshed.metadata))?;
                if !retranslated.schema.same_fields(&translation.schema) {
                    return Err(e);
                }
                let pending = PendingCommit {
                    data_files,
                    schema_update: schema_update(&retranslated),
                };
                self.catalog.commit(&refreshed, pending)
            }
            other => other,
        }
    }
}

fn schema_update(translation: &SchemaTranslation) -> Option<SchemaUpdate> {
    translation.changed.then(|| SchemaUpdate {
        schema: translation.schema.clone(),
        last_column_id: translation.last_column_id,
    })
}
