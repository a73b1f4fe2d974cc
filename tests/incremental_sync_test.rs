// ABOUTME: End-to-end incremental sync tests between two SQLite databases
// ABOUTME: Covers multi-cycle syncs, idempotent re-runs, integer sequences, append and schema evolution

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use iceberg_replicator::iceberg::catalog::{FilesystemCatalog, PendingCommit, TableCatalog};
use iceberg_replicator::iceberg::data_file::{ColumnarFileWriter, DataFileWriterConfig};
use iceberg_replicator::iceberg::types::Value;
use iceberg_replicator::sync::change_detection::ChangeDetectionKind;
use iceberg_replicator::sync::coordinator::{
    CoordinatorConfig, CycleResult, IncrementalSyncCoordinator, MergeStrategy,
};
use iceberg_replicator::sync::sink::SqliteSink;
use iceberg_replicator::sync::source::SqliteSource;
use iceberg_replicator::sync::watermark::{WatermarkStore, WatermarkValue};
use rusqlite::{params, Connection};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    source: PathBuf,
    destination: PathBuf,
    coordinator: IncrementalSyncCoordinator<FilesystemCatalog>,
}

impl Fixture {
    fn new(ddl: &str, config: CoordinatorConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.db");
        let destination = dir.path().join("destination.db");
        Connection::open(&source).unwrap().execute_batch(ddl).unwrap();

        let catalog = FilesystemCatalog::new(dir.path().join("warehouse")).unwrap();
        let store = WatermarkStore::new(dir.path().join("watermarks")).unwrap();
        let coordinator = IncrementalSyncCoordinator::new(catalog, store, config).unwrap();
        Self {
            _dir: dir,
            source,
            destination,
            coordinator,
        }
    }

    fn source_conn(&self) -> Connection {
        Connection::open(&self.source).unwrap()
    }

    fn run(&self, source_table: &str, dest_table: &str) -> CycleResult {
        let source = SqliteSource::open(&self.source, source_table, 16).unwrap();
        let mut sink = SqliteSink::open(&self.destination, dest_table).unwrap();
        let result = self.coordinator.run_cycle(&source, &mut sink);
        assert!(result.is_success(), "cycle failed: {:?}", result.error);
        result
    }

    fn dest_count(&self, sql: &str) -> i64 {
        count(&self.destination, sql)
    }
}

fn count(db: &Path, sql: &str) -> i64 {
    Connection::open(db)
        .unwrap()
        .query_row(sql, [], |r| r.get(0))
        .unwrap()
}

fn ts(offset_secs: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + chrono::Duration::seconds(offset_secs)
}

fn ts_text(offset_secs: i64) -> String {
    ts(offset_secs).format("%Y-%m-%d %H:%M:%S").to_string()
}

const ORDERS_DDL: &str = "CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    customer TEXT NOT NULL,
    amount DECIMAL(10,2),
    updated_at DATETIME NOT NULL
);";

fn insert_orders(conn: &Connection, ids: std::ops::RangeInclusive<i64>) {
    for id in ids {
        conn.execute(
            "INSERT INTO orders (id, customer, amount, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, format!("customer-{}", id), format!("{}.25", id), ts_text(id)],
        )
        .unwrap();
    }
}

fn orders_fixture() -> Fixture {
    Fixture::new(
        ORDERS_DDL,
        CoordinatorConfig::new("orders", "updated_at", &["id"]),
    )
}

#[test]
fn test_three_cycles_converge_without_duplicates() {
    let fx = orders_fixture();
    let conn = fx.source_conn();

    insert_orders(&conn, 1..=100);
    let first = fx.run("orders", "orders");
    assert_eq!(first.rows_extracted, 100);
    assert_eq!(first.watermark, Some(WatermarkValue::Timestamp(ts(100))));
    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM orders"), 100);

    insert_orders(&conn, 101..=150);
    let second = fx.run("orders", "orders");
    assert_eq!(second.rows_extracted, 50);
    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM orders"), 150);

    insert_orders(&conn, 151..=180);
    conn.execute(
        "UPDATE orders SET customer = 'updated', updated_at = ?1 WHERE id <= 5",
        params![ts_text(1000)],
    )
    .unwrap();
    let third = fx.run("orders", "orders");
    assert_eq!(third.rows_extracted, 35);
    assert_eq!(third.watermark, Some(WatermarkValue::Timestamp(ts(1000))));

    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM orders"), 180);
    assert_eq!(fx.dest_count("SELECT COUNT(DISTINCT id) FROM orders"), 180);
    assert_eq!(
        fx.dest_count("SELECT COUNT(*) FROM orders WHERE customer = 'updated'"),
        5
    );

    // The table keeps every appended batch as history
    let catalog = fx.coordinator.catalog();
    let table = catalog.load("orders").unwrap();
    assert_eq!(table.metadata.snapshots.len(), 3);
    assert_eq!(catalog.scan(&table).unwrap().len(), 185);
}

#[test]
fn test_rerunning_a_cycle_is_idempotent_under_upsert() {
    let fx = orders_fixture();
    let conn = fx.source_conn();

    insert_orders(&conn, 1..=100);
    fx.run("orders", "orders");
    insert_orders(&conn, 101..=150);
    fx.run("orders", "orders");

    // Simulate a crash after the merge but before the watermark write
    fx.coordinator
        .store()
        .set("orders", "updated_at", WatermarkValue::Timestamp(ts(100)))
        .unwrap();
    let rerun = fx.run("orders", "orders");
    assert_eq!(rerun.rows_extracted, 50);
    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM orders"), 150);
    assert_eq!(rerun.watermark, Some(WatermarkValue::Timestamp(ts(150))));

    let amount: f64 = Connection::open(&fx.destination)
        .unwrap()
        .query_row("SELECT amount FROM orders WHERE id = 120", [], |r| r.get(0))
        .unwrap();
    assert_eq!(amount, 120.25);
}

#[test]
fn test_no_changes_creates_no_snapshot() {
    let fx = orders_fixture();
    insert_orders(&fx.source_conn(), 1..=10);
    fx.run("orders", "orders");
    let before = fx.coordinator.catalog().load("orders").unwrap();

    let idle = fx.run("orders", "orders");
    assert_eq!(idle.rows_extracted, 0);
    assert_eq!(idle.rows_applied, 0);
    assert_eq!(idle.snapshot_id, None);
    assert_eq!(idle.watermark, Some(WatermarkValue::Timestamp(ts(10))));

    let after = fx.coordinator.catalog().load("orders").unwrap();
    assert_eq!(before.version, after.version);
    assert_eq!(after.metadata.snapshots.len(), 1);
}

#[test]
fn test_first_run_on_empty_source() {
    let fx = orders_fixture();
    let result = fx.run("orders", "orders");
    assert_eq!(result.rows_extracted, 0);
    assert_eq!(result.watermark, None);
    assert!(fx.coordinator.store().get("orders").unwrap().is_none());
}

const EVENTS_DDL: &str = "CREATE TABLE events (
    seq INTEGER PRIMARY KEY,
    payload TEXT
);";

fn insert_events(conn: &Connection, seqs: std::ops::RangeInclusive<i64>) {
    for seq in seqs {
        conn.execute(
            "INSERT INTO events (seq, payload) VALUES (?1, ?2)",
            params![seq, format!("event-{}", seq)],
        )
        .unwrap();
    }
}

fn events_fixture() -> Fixture {
    let mut config = CoordinatorConfig::new("events", "seq", &[]);
    config.change_detection = ChangeDetectionKind::Integer;
    config.merge_strategy = MergeStrategy::Append;
    Fixture::new(EVENTS_DDL, config)
}

#[test]
fn test_integer_sequence_with_append() {
    let fx = events_fixture();
    let conn = fx.source_conn();

    insert_events(&conn, 1..=10);
    let first = fx.run("events", "events_copy");
    assert_eq!(first.rows_applied, 10);
    assert_eq!(first.watermark, Some(WatermarkValue::Integer(10)));

    insert_events(&conn, 11..=15);
    let second = fx.run("events", "events_copy");
    assert_eq!(second.rows_extracted, 5);
    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM events_copy"), 15);
    assert_eq!(fx.dest_count("SELECT MAX(seq) FROM events_copy"), 15);
}

#[test]
fn test_append_rerun_duplicates_rows() {
    let fx = events_fixture();
    insert_events(&fx.source_conn(), 1..=10);
    fx.run("events", "events_copy");

    fx.coordinator.store().reset("events").unwrap();
    fx.run("events", "events_copy");
    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM events_copy"), 20);
    assert_eq!(fx.dest_count("SELECT COUNT(DISTINCT seq) FROM events_copy"), 10);
}

#[test]
fn test_source_schema_evolution_flows_to_destination() {
    let fx = orders_fixture();
    let conn = fx.source_conn();
    insert_orders(&conn, 1..=5);
    fx.run("orders", "orders");

    conn.execute_batch("ALTER TABLE orders ADD COLUMN status TEXT")
        .unwrap();
    conn.execute(
        "INSERT INTO orders (id, customer, amount, updated_at, status) VALUES (6, 'c6', '6.25', ?1, 'new')",
        params![ts_text(6)],
    )
    .unwrap();
    let result = fx.run("orders", "orders");
    assert_eq!(result.rows_extracted, 1);

    let table = fx.coordinator.catalog().load("orders").unwrap();
    assert_eq!(table.metadata.schemas.len(), 2);
    let status = table.current_schema().unwrap().field_by_name("status").unwrap();
    assert_eq!(status.id, 5);

    assert_eq!(
        fx.dest_count("SELECT COUNT(*) FROM orders WHERE status = 'new'"),
        1
    );
    assert_eq!(
        fx.dest_count("SELECT COUNT(*) FROM orders WHERE status IS NULL"),
        5
    );
}

fn stage_orders_commit(fx: &Fixture) -> iceberg_replicator::iceberg::catalog::StagedCommit {
    let catalog = fx.coordinator.catalog();
    let table = catalog.load("orders").unwrap();
    let mut writer = ColumnarFileWriter::new(
        &table.data_dir(),
        table.current_schema().unwrap(),
        DataFileWriterConfig::default(),
    )
    .unwrap();
    writer
        .write_row(vec![
            Value::Long(999),
            Value::String("ghost".to_string()),
            Value::Null,
            Value::Timestamp(ts(999)),
        ])
        .unwrap();
    catalog
        .stage(
            &table,
            PendingCommit {
                data_files: writer.finish().unwrap(),
                schema_update: None,
            },
        )
        .unwrap()
}

#[test]
fn test_cycles_continue_after_a_cancelled_commit() {
    let fx = orders_fixture();
    let conn = fx.source_conn();
    insert_orders(&conn, 1..=10);
    fx.run("orders", "orders");

    // One commit cancelled before publish, one abandoned by a killed process
    drop(stage_orders_commit(&fx));
    std::mem::forget(stage_orders_commit(&fx));

    for batch in 0..3i64 {
        let first = 11 + batch * 5;
        insert_orders(&conn, first..=first + 4);
        let result = fx.run("orders", "orders");
        assert_eq!(result.rows_extracted, 5);
        assert!(result.snapshot_id.is_some());
    }

    let table = fx.coordinator.catalog().load("orders").unwrap();
    assert_eq!(table.version, 5);
    assert_eq!(table.metadata.snapshots.len(), 4);
    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM orders"), 25);
    assert_eq!(fx.dest_count("SELECT COUNT(*) FROM orders WHERE id = 999"), 0);
}
