// ABOUTME: Integration tests for the iceberg-replicator binary
// ABOUTME: Runs sync, inspect, watermark and repair against temporary SQLite databases

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use iceberg_replicator::iceberg::catalog::{FilesystemCatalog, PendingCommit, TableCatalog};
use iceberg_replicator::iceberg::data_file::{ColumnarFileWriter, DataFileWriterConfig};
use iceberg_replicator::iceberg::types::Value;
use rusqlite::Connection;
use tempfile::tempdir;

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_iceberg-replicator"));
    cmd.env_remove("ICEBERG_REPLICATOR_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_config(dir: &Path, source_table: &str) -> std::path::PathBuf {
    let config = format!(
        r#"
warehouse = "warehouse"
watermark_dir = "watermarks"

[[jobs]]
source = "source.db"
source_table = "{}"
table = "orders"
destination = "dest.db"
primary_key = ["id"]
watermark_column = "updated_at"
"#,
        source_table
    );
    let path = dir.join("replicator.toml");
    fs::write(&path, config).unwrap();
    path
}

fn seed_source(dir: &Path) {
    let conn = Connection::open(dir.join("source.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT, updated_at DATETIME NOT NULL);
         INSERT INTO orders VALUES (1, 'a', '2024-01-01 10:00:00');
         INSERT INTO orders VALUES (2, 'b', '2024-01-01 11:00:00');
         INSERT INTO orders VALUES (3, 'c', '2024-01-01 12:00:00');",
    )
    .unwrap();
}

#[test]
fn test_help_lists_commands() {
    let output = bin().arg("--help").output().expect("Failed to execute command");
    assert!(output.status.success());
    let out = stdout(&output);
    for command in ["sync", "inspect", "watermark", "repair"] {
        assert!(out.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_sync_once_then_inspect_and_watermark() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path();
    seed_source(dir);
    let config = write_config(dir, "orders");

    let output = bin()
        .args(["sync", "--once", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout(&output).contains("orders: 3 extracted, 3 applied"));

    let rows: i64 = Connection::open(dir.join("dest.db"))
        .unwrap()
        .query_row("SELECT COUNT(*) FROM orders", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 3);

    let output = bin()
        .args(["inspect", "orders", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Version:        2"));
    assert!(out.contains("customer"));
    assert!(out.contains("added 3 rows"));

    let output = bin()
        .args(["inspect", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");
    assert_eq!(stdout(&output).trim(), "orders");

    let output = bin()
        .args(["watermark", "get", "orders", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");
    let out = stdout(&output);
    assert!(out.contains("updated_at"));
    assert!(out.contains("2024-01-01 12:00:00"));

    let output = bin()
        .args(["watermark", "reset", "orders", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");
    assert!(stdout(&output).contains("Watermark for 'orders' removed"));
    assert!(!dir.join("watermarks").join("orders.json").exists());
}

#[test]
fn test_sync_once_fails_for_missing_source_table() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path();
    seed_source(dir);
    let config = write_config(dir, "no_such_table");

    let output = bin()
        .args(["sync", "--once", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");
    assert!(!output.status.success());
    assert!(stdout(&output).contains("orders: FAILED"));
}

#[test]
fn test_sync_requires_config() {
    let output = bin()
        .args(["sync", "--once"])
        .output()
        .expect("Failed to execute command");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--config"));
}

#[test]
fn test_watermark_list_empty_dir() {
    let temp_dir = tempdir().unwrap();
    let output = bin()
        .args(["watermark", "list", "--dir"])
        .arg(temp_dir.path())
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());
    assert!(stdout(&output).is_empty());
}

#[test]
fn test_repair_removes_leftover_staged_metadata() {
    let temp_dir = tempdir().unwrap();
    let warehouse = temp_dir.path().join("warehouse");
    let catalog = FilesystemCatalog::new(&warehouse).unwrap();
    let schema = iceberg_replicator::iceberg::types::TableSchema::new(
        0,
        vec![iceberg_replicator::iceberg::types::FieldDescriptor::new(
            1,
            "id",
            iceberg_replicator::iceberg::types::PrimitiveType::Long,
            true,
        )],
    );
    let table = catalog.create("orders", schema).unwrap();
    let mut writer = ColumnarFileWriter::new(
        &table.data_dir(),
        table.current_schema().unwrap(),
        DataFileWriterConfig::default(),
    )
    .unwrap();
    writer.write_row(vec![Value::Long(1)]).unwrap();
    let staged = catalog
        .stage(
            &table,
            PendingCommit {
                data_files: writer.finish().unwrap(),
                schema_update: None,
            },
        )
        .unwrap();
    // A process killed mid-commit never cleans up its staged metadata
    let orphan = staged.staged_path().to_path_buf();
    std::mem::forget(staged);

    let output = bin()
        .args(["repair", "orders", "--dry-run", "--warehouse"])
        .arg(&warehouse)
        .output()
        .expect("Failed to execute command");
    assert!(stdout(&output).contains("Would remove"));
    assert!(orphan.exists());

    let output = bin()
        .args(["repair", "orders", "--warehouse"])
        .arg(&warehouse)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());
    assert!(stdout(&output).contains("Removed"));
    assert!(!orphan.exists());
    assert_eq!(catalog.load("orders").unwrap().version, 1);
}
