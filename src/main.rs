// ABOUTME: CLI entry point for iceberg-replicator
// ABOUTME: Parses commands and routes to sync, inspect, watermark and repair handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use iceberg_replicator::config::{SyncConfig, SyncJobConfig};
use iceberg_replicator::iceberg::{FilesystemCatalog, LoadedTable, TableCatalog};
use iceberg_replicator::sync::daemon::CycleStats;
use iceberg_replicator::sync::{DaemonConfig, SyncDaemon, WatermarkStore};

#[derive(Parser)]
#[command(name = "iceberg-replicator")]
#[command(about = "Incremental database replication through a local Iceberg table", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the TOML sync configuration
    #[arg(long, short = 'c', global = true, env = "ICEBERG_REPLICATOR_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run configured sync jobs (continuously unless --once)
    Sync {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Only run jobs for these table-format tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
        /// Seconds between cycles (overrides the config file)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show tables in the warehouse, or the state of one table
    Inspect {
        /// Table-format table name
        table: Option<String>,
        /// Warehouse directory (defaults to the config file's warehouse)
        #[arg(long)]
        warehouse: Option<PathBuf>,
    },
    /// Read or reset stored watermarks
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
        /// Watermark directory (defaults to the config file's watermark_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Remove metadata versions left behind by commits that never published
    Repair {
        table: String,
        /// Warehouse directory (defaults to the config file's warehouse)
        #[arg(long)]
        warehouse: Option<PathBuf>,
        /// Only list what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum WatermarkAction {
    /// Show the watermark of one table
    Get { table: String },
    /// List all watermarks
    List,
    /// Forget a table's watermark so the next cycle re-extracts everything
    Reset { table: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync {
            once,
            tables,
            interval,
        } => {
            let config = load_config(cli.config.as_deref())?;
            sync(config, once, tables, interval).await
        }
        Commands::Inspect { table, warehouse } => {
            let warehouse = resolve_warehouse(cli.config.as_deref(), warehouse)?;
            inspect(&warehouse, table.as_deref())
        }
        Commands::Watermark { action, dir } => {
            let dir = resolve_watermark_dir(cli.config.as_deref(), dir)?;
            watermark(&dir, action)
        }
        Commands::Repair {
            table,
            warehouse,
            dry_run,
        } => {
            let warehouse = resolve_warehouse(cli.config.as_deref(), warehouse)?;
            repair(&warehouse, &table, dry_run)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SyncConfig> {
    let path = path.ok_or_else(|| {
        anyhow::anyhow!("No configuration file given. Use `--config <path>` or ICEBERG_REPLICATOR_CONFIG.")
    })?;
    SyncConfig::load(path)
}

fn resolve_warehouse(config: Option<&Path>, flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match flag {
        Some(dir) => Ok(dir),
        None => Ok(load_config(config)
            .context("Pass --warehouse or a configuration file")?
            .warehouse),
    }
}

fn resolve_watermark_dir(config: Option<&Path>, flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match (flag, config) {
        (Some(dir), _) => Ok(dir),
        (None, Some(path)) => Ok(SyncConfig::load(path)?.watermark_dir),
        (None, None) => Ok(WatermarkStore::default_dir()),
    }
}

fn select_jobs(config: &SyncConfig, tables: Option<Vec<String>>) -> anyhow::Result<Vec<SyncJobConfig>> {
    let Some(tables) = tables else {
        return Ok(config.jobs.clone());
    };
    tables
        .iter()
        .map(|table| {
            config
                .job(table)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("No job configured for table '{}'", table))
        })
        .collect()
}

async fn sync(
    config: SyncConfig,
    once: bool,
    tables: Option<Vec<String>>,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let jobs = select_jobs(&config, tables)?;
    if jobs.is_empty() {
        bail!("No sync jobs configured");
    }

    let mut daemon_config = DaemonConfig::from_sync_config(&config);
    if let Some(secs) = interval {
        if secs == 0 {
            bail!("--interval must be positive");
        }
        daemon_config.sync_interval = std::time::Duration::from_secs(secs);
    }
    let daemon = SyncDaemon::new(daemon_config, jobs);

    if once {
        let stats = daemon.run_sync_cycle().await;
        print_cycle(&stats);
        if !stats.is_success() {
            bail!(
                "{} of {} sync jobs failed",
                stats.failures().count(),
                stats.results.len()
            );
        }
        return Ok(());
    }

    tracing::info!("Starting continuous sync daemon, press Ctrl+C to stop");
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx_clone.send(());
    });

    daemon.run(shutdown_rx).await?;
    Ok(())
}

fn print_cycle(stats: &CycleStats) {
    println!("Sync cycle complete in {}ms", stats.duration_ms);
    for result in &stats.results {
        let watermark = result
            .watermark
            .map(|w| w.to_string())
            .unwrap_or_else(|| "-".to_string());
        if result.is_success() {
            println!(
                "  {}: {} extracted, {} applied, snapshot {}, watermark {}",
                result.table,
                result.rows_extracted,
                result.rows_applied,
                result
                    .snapshot_id
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                watermark
            );
        } else {
            println!(
                "  {}: FAILED: {}",
                result.table,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

fn inspect(warehouse: &Path, table: Option<&str>) -> anyhow::Result<()> {
    let catalog = FilesystemCatalog::new(warehouse)
        .with_context(|| format!("Failed to open warehouse {}", warehouse.display()))?;

    let Some(name) = table else {
        let tables = catalog.list_tables()?;
        if tables.is_empty() {
            println!("No tables in {}", catalog.warehouse().display());
        }
        for name in tables {
            println!("{}", name);
        }
        return Ok(());
    };

    let loaded = catalog
        .load(name)
        .with_context(|| format!("Failed to load table '{}'", name))?;
    print_table(&loaded)?;

    let orphans = catalog.uncommitted_metadata(name)?;
    if !orphans.is_empty() {
        println!();
        println!("Uncommitted metadata (run `repair {}`):", name);
        for path in orphans {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

fn print_table(table: &LoadedTable) -> anyhow::Result<()> {
    let metadata = &table.metadata;
    let schema = table.current_schema()?;
    println!("Table:          {}", table.name);
    println!("Location:       {}", table.location.display());
    println!("UUID:           {}", metadata.table_uuid);
    println!("Version:        {}", table.version);
    println!("Schema id:      {}", schema.schema_id);
    println!("Last column id: {}", metadata.last_column_id);
    println!();
    println!("Columns:");
    for field in &schema.fields {
        println!(
            "  {:>4}  {:<30} {}{}",
            field.id,
            field.name,
            field.field_type,
            if field.required { " (required)" } else { "" }
        );
    }
    println!();
    println!("Snapshots:");
    if metadata.snapshots.is_empty() {
        println!("  (none)");
    }
    for snapshot in &metadata.snapshots {
        let current = if Some(snapshot.snapshot_id) == metadata.current_snapshot_id {
            " *"
        } else {
            ""
        };
        println!(
            "  {}  seq {}  added {} rows  total {} rows{}",
            snapshot.snapshot_id,
            snapshot.sequence_number,
            snapshot.summary.get("added-records").map_or("0", String::as_str),
            snapshot.summary.get("total-records").map_or("0", String::as_str),
            current
        );
    }
    Ok(())
}

fn watermark(dir: &Path, action: WatermarkAction) -> anyhow::Result<()> {
    let store = WatermarkStore::new(dir)
        .with_context(|| format!("Failed to open watermark directory {}", dir.display()))?;
    match action {
        WatermarkAction::Get { table } => match store.get(&table)? {
            Some(w) => println!("{}\t{}\t{}\t{}", w.table, w.column, w.value, w.as_of.to_rfc3339()),
            None => println!("No watermark for '{}'", table),
        },
        WatermarkAction::List => {
            for w in store.list()? {
                println!("{}\t{}\t{}\t{}", w.table, w.column, w.value, w.as_of.to_rfc3339());
            }
        }
        WatermarkAction::Reset { table } => {
            if store.reset(&table)? {
                println!("Watermark for '{}' removed", table);
            } else {
                println!("No watermark for '{}'", table);
            }
        }
    }
    Ok(())
}

fn repair(warehouse: &Path, table: &str, dry_run: bool) -> anyhow::Result<()> {
    let catalog = FilesystemCatalog::new(warehouse)
        .with_context(|| format!("Failed to open warehouse {}", warehouse.display()))?;
    let orphans = if dry_run {
        catalog.uncommitted_metadata(table)?
    } else {
        catalog.remove_uncommitted_metadata(table)?
    };
    if orphans.is_empty() {
        println!("Table '{}' has no uncommitted metadata", table);
    }
    for path in orphans {
        let verb = if dry_run { "Would remove" } else { "Removed" };
        println!("{} {}", verb, path.display());
    }
    Ok(())
}
