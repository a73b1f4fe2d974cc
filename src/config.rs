// ABOUTME: TOML sync configuration - warehouse, watermark directory and per-table jobs
// ABOUTME: Loaded once by the CLI and passed explicitly to the daemon and coordinators

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::iceberg::data_file::DataFileWriterConfig;
use crate::sync::change_detection::ChangeDetectionKind;
use crate::sync::coordinator::{CoordinatorConfig, MergeStrategy};
use crate::sync::watermark::WatermarkStore;
use crate::utils::validate_table_name;

fn default_batch_size() -> usize {
    10_000
}

fn default_target_file_rows() -> u64 {
    DataFileWriterConfig::default().target_file_rows
}

fn default_target_file_bytes() -> u64 {
    DataFileWriterConfig::default().target_file_bytes
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_watermark_dir() -> PathBuf {
    WatermarkStore::default_dir()
}

/// One source table synced through one table-format table into one destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobConfig {
    /// Path of the source SQLite database
    pub source: PathBuf,
    pub source_table: String,
    /// Table-format table name (directory under the warehouse)
    pub table: String,
    /// Path of the destination SQLite database
    pub destination: PathBuf,
    /// Destination table; defaults to `source_table`
    #[serde(default)]
    pub destination_table: Option<String>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    pub watermark_column: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub change_detection: ChangeDetectionKind,
    /// Rows fetched from the source per query
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_target_file_rows")]
    pub target_file_rows: u64,
    #[serde(default = "default_target_file_bytes")]
    pub target_file_bytes: u64,
}

impl SyncJobConfig {
    pub fn destination_table(&self) -> &str {
        self.destination_table
            .as_deref()
            .unwrap_or(&self.source_table)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            table: self.table.clone(),
            primary_key: self.primary_key.clone(),
            watermark_column: self.watermark_column.clone(),
            merge_strategy: self.merge_strategy,
            change_detection: self.change_detection,
            writer: DataFileWriterConfig {
                target_file_rows: self.target_file_rows,
                target_file_bytes: self.target_file_bytes,
                ..DataFileWriterConfig::default()
            },
        }
    }

    fn validate(&self) -> Result<()> {
        validate_table_name(&self.table)
            .with_context(|| format!("Invalid table name in job '{}'", self.table))?;
        if self.source_table.is_empty() {
            bail!("Job '{}' has an empty source_table", self.table);
        }
        if self.watermark_column.is_empty() {
            bail!("Job '{}' has an empty watermark_column", self.table);
        }
        if self.merge_strategy == MergeStrategy::Upsert && self.primary_key.is_empty() {
            bail!(
                "Job '{}' uses merge_strategy = \"upsert\" but lists no primary_key columns",
                self.table
            );
        }
        if self.batch_size == 0 || self.target_file_rows == 0 || self.target_file_bytes == 0 {
            bail!(
                "Job '{}': batch_size and target file thresholds must be positive",
                self.table
            );
        }
        Ok(())
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory holding the table-format tables
    pub warehouse: PathBuf,
    #[serde(default = "default_watermark_dir")]
    pub watermark_dir: PathBuf,
    /// Seconds between daemon cycles
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub jobs: Vec<SyncJobConfig>,
}

impl SyncConfig {
    /// Read and validate a TOML configuration file.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 {
            bail!("sync_interval_secs must be positive");
        }
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !seen.insert(job.table.as_str()) {
                bail!("Table '{}' is configured by more than one job", job.table);
            }
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Job for a table-format table name.
    pub fn job(&self, table: &str) -> Option<&SyncJobConfig> {
        self.jobs.iter().find(|j| j.table == table)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.warehouse);
        resolve(&mut self.watermark_dir);
        for job in &mut self.jobs {
            resolve(&mut job.source);
            resolve(&mut job.destination);
        }
    }
}
