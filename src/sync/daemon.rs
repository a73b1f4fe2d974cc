// ABOUTME: SyncDaemon - runs every configured job once per cycle on a fixed interval
// ABOUTME: Each job runs on its own blocking task so one table's failure never stops the others

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::time::interval;

use crate::config::{SyncConfig, SyncJobConfig};
use crate::error::Result;
use crate::iceberg::catalog::FilesystemCatalog;
use crate::sync::coordinator::{CycleResult, IncrementalSyncCoordinator};
use crate::sync::sink::SqliteSink;
use crate::sync::source::SqliteSource;
use crate::sync::watermark::WatermarkStore;

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between sync cycles
    pub sync_interval: Duration,
    /// Stop after this many cycles (None = run until shutdown)
    pub max_cycles: Option<u64>,
    pub warehouse: PathBuf,
    pub watermark_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            max_cycles: None,
            warehouse: PathBuf::from("warehouse"),
            watermark_dir: WatermarkStore::default_dir(),
        }
    }
}

impl DaemonConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            sync_interval: config.sync_interval(),
            max_cycles: None,
            warehouse: config.warehouse.clone(),
            watermark_dir: config.watermark_dir.clone(),
        }
    }
}

/// Results of one daemon cycle across all jobs.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub results: Vec<CycleResult>,
    pub duration_ms: u64,
}

impl CycleStats {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.is_success())
    }

    pub fn rows_applied(&self) -> u64 {
        self.results.iter().map(|r| r.rows_applied).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CycleResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Run one cycle of `job`, building its source, sink and coordinator.
///
/// Setup failures (unreadable source, bad table name) are reported in the
/// returned result like any other cycle failure.
pub fn run_job(config: &DaemonConfig, job: &SyncJobConfig) -> CycleResult {
    let start = Instant::now();
    match run_job_inner(config, job) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Failed to start sync for '{}': {}", job.table, e);
            CycleResult {
                table: job.table.clone(),
                rows_extracted: 0,
                rows_applied: 0,
                snapshot_id: None,
                watermark: None,
                success: false,
                error: Some(e.to_string()),
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
    }
}

fn run_job_inner(config: &DaemonConfig, job: &SyncJobConfig) -> Result<CycleResult> {
    let catalog = FilesystemCatalog::new(&config.warehouse)?;
    let store = WatermarkStore::new(&config.watermark_dir)?;
    let coordinator = IncrementalSyncCoordinator::new(catalog, store, job.coordinator_config())?;
    let source = SqliteSource::open(&job.source, &job.source_table, job.batch_size)?;
    let mut sink = SqliteSink::open(&job.destination, job.destination_table())?;
    Ok(coordinator.run_cycle(&source, &mut sink))
}

/// SyncDaemon runs a batch of table jobs per cycle.
pub struct SyncDaemon {
    config: DaemonConfig,
    jobs: Vec<SyncJobConfig>,
}

impl SyncDaemon {
    pub fn new(config: DaemonConfig, jobs: Vec<SyncJobConfig>) -> Self {
        Self { config, jobs }
    }

    /// Run every job once, concurrently, and wait for all of them.
    pub async fn run_sync_cycle(&self) -> CycleStats {
        let start = Instant::now();

        let handles: Vec<_> = self
            .jobs
            .iter()
            .cloned()
            .map(|job| {
                let config = self.config.clone();
                let table = job.table.clone();
                let handle = tokio::task::spawn_blocking(move || run_job(&config, &job));
                (table, handle)
            })
            .collect();

        let (tables, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;

        let results = tables
            .into_iter()
            .zip(joined)
            .map(|(table, joined)| match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Sync task for '{}' did not complete: {}", table, e);
                    CycleResult {
                        table,
                        rows_extracted: 0,
                        rows_applied: 0,
                        snapshot_id: None,
                        watermark: None,
                        success: false,
                        error: Some(format!("sync task aborted: {}", e)),
                        duration_ms: 0,
                    }
                }
            })
            .collect();

        CycleStats {
            results,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Run cycles at the configured interval until shutdown or `max_cycles`.
    ///
    /// A cycle in flight when shutdown arrives is allowed to finish; its
    /// commits and watermark writes are never cut short.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut sync_interval = interval(self.config.sync_interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting SyncDaemon with {} jobs, sync_interval={:?}",
            self.jobs.len(),
            self.config.sync_interval
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = sync_interval.tick() => {
                    cycles += 1;
                    tracing::info!("Starting sync cycle {}", cycles);

                    let stats = self.run_sync_cycle().await;
                    tracing::info!(
                        "Sync cycle {} completed: {} jobs, {} rows applied in {}ms",
                        cycles,
                        stats.results.len(),
                        stats.rows_applied(),
                        stats.duration_ms
                    );
                    for failed in stats.failures() {
                        tracing::warn!(
                            "  {} failed: {}",
                            failed.table,
                            failed.error.as_deref().unwrap_or("unknown error")
                        );
                    }

                    if self.config.max_cycles.is_some_and(|max| cycles >= max) {
                        tracing::info!("Reached {} cycles, stopping SyncDaemon", cycles);
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
