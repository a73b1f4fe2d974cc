// ABOUTME: FilesystemCatalog - table lifecycle and optimistic-concurrency commits on local disk
// ABOUTME: Pointer swap via temp-file rename; metadata versions are created no-clobber

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::data_file::{read_data_file, DataFile};
use crate::iceberg::manifest::{read_manifest, ManifestEntry, ManifestStatus, ManifestWriter};
use crate::iceberg::manifest_list::{read_manifest_list, ManifestListWriter};
use crate::iceberg::metadata::{append_summary, now_ms, MetadataLogEntry, Snapshot, TableMetadata};
use crate::iceberg::types::{Row, TableSchema};
use crate::utils::{
    link_exclusive, sanitize_identifier, validate_table_name, write_atomic, write_exclusive,
};

/// Name of the pointer file naming the current metadata version.
pub const VERSION_HINT_FILE: &str = "version-hint.txt";
const METADATA_DIR: &str = "metadata";
const DATA_DIR: &str = "data";
const STAGED_SUFFIX: &str = ".staged.json";
const CLAIM_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Table state as read from the catalog at a given pointer version.
#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub name: String,
    pub location: PathBuf,
    /// Pointer value this state was loaded at; the expected version for the next commit.
    pub version: u64,
    pub metadata: TableMetadata,
}

impl LoadedTable {
    pub fn data_dir(&self) -> PathBuf {
        self.location.join(DATA_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.location.join(METADATA_DIR)
    }

    pub fn current_schema(&self) -> Result<&TableSchema> {
        self.metadata.current_schema()
    }

    pub fn current_snapshot_id(&self) -> Option<i64> {
        self.metadata.current_snapshot_id
    }
}

/// New schema version to make current as part of a commit.
#[derive(Debug, Clone)]
pub struct SchemaUpdate {
    pub schema: TableSchema,
    pub last_column_id: i32,
}

/// Everything a single commit adds to a table.
#[derive(Debug, Clone, Default)]
pub struct PendingCommit {
    pub data_files: Vec<DataFile>,
    pub schema_update: Option<SchemaUpdate>,
}

/// A commit whose files and metadata are durable but not yet visible.
///
/// The next metadata version sits under a private staged name until
/// [`FilesystemCatalog::publish`] claims `v<N+1>.metadata.json` and moves the
/// pointer. Dropping an unpublished commit removes the staged file, so a
/// cancelled commit never blocks the next writer.
#[derive(Debug)]
pub struct StagedCommit {
    table: LoadedTable,
    metadata_path: PathBuf,
    staged_path: PathBuf,
}

impl StagedCommit {
    pub fn version(&self) -> u64 {
        self.table.version
    }

    pub fn snapshot_id(&self) -> Option<i64> {
        self.table.metadata.current_snapshot_id
    }

    /// Final `v<N+1>.metadata.json` path, claimed at publish.
    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Where the metadata lives until publish.
    pub fn staged_path(&self) -> &Path {
        &self.staged_path
    }
}

impl Drop for StagedCommit {
    fn drop(&mut self) {
        match fs::remove_file(&self.staged_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove staged metadata {}: {}",
                self.staged_path.display(),
                e
            ),
        }
    }
}

/// Storage-independent catalog operations used by the sync coordinator.
pub trait TableCatalog {
    fn exists(&self, name: &str) -> bool;
    fn create(&self, name: &str, schema: TableSchema) -> Result<LoadedTable>;
    fn load(&self, name: &str) -> Result<LoadedTable>;
    fn commit(&self, table: &LoadedTable, pending: PendingCommit) -> Result<LoadedTable>;
    fn read_snapshot_rows(&self, table: &LoadedTable, snapshot_id: i64) -> Result<Vec<Row>>;
}

/// Catalog of tables stored as directories under one warehouse directory.
#[derive(Debug, Clone)]
pub struct FilesystemCatalog {
    warehouse: PathBuf,
}

impl FilesystemCatalog {
    /// Open (creating if needed) a warehouse directory.
    pub fn new(warehouse: impl AsRef<Path>) -> Result<Self> {
        let warehouse = warehouse.as_ref();
        fs::create_dir_all(warehouse).map_err(|e| ReplicatorError::io(warehouse, e))?;
        let warehouse = warehouse
            .canonicalize()
            .map_err(|e| ReplicatorError::io(warehouse, e))?;
        Ok(Self { warehouse })
    }

    pub fn warehouse(&self) -> &Path {
        &self.warehouse
    }

    pub fn table_location(&self, name: &str) -> PathBuf {
        self.warehouse.join(name)
    }

    fn pointer_path(&self, name: &str) -> PathBuf {
        self.table_location(name)
            .join(METADATA_DIR)
            .join(VERSION_HINT_FILE)
    }

    fn metadata_path(&self, name: &str, version: u64) -> PathBuf {
        self.table_location(name)
            .join(METADATA_DIR)
            .join(format!("v{}.metadata.json", version))
    }

    /// Current pointer value of a table.
    pub fn current_version(&self, name: &str) -> Result<u64> {
        let path = self.pointer_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReplicatorError::TableNotFound(name.to_string()))
            }
            Err(e) => return Err(ReplicatorError::io(&path, e)),
        };
        text.trim()
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| ReplicatorError::CorruptCatalog {
                table: name.to_string(),
                message: format!("malformed pointer {:?}", sanitize_identifier(text.trim())),
            })
    }

    /// Tables under the warehouse that have a pointer file, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let entries =
            fs::read_dir(&self.warehouse).map_err(|e| ReplicatorError::io(&self.warehouse, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ReplicatorError::io(&self.warehouse, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && self.exists(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Create a table partitioned by identity on `partition_columns`
    /// (unpartitioned when empty).
    pub fn create_with_partitioning(
        &self,
        name: &str,
        schema: TableSchema,
        partition_columns: &[&str],
    ) -> Result<LoadedTable> {
        validate_table_name(name)?;
        if self.exists(name) {
            return Err(ReplicatorError::TableAlreadyExists(name.to_string()));
        }

        let location = self.table_location(name);
        for dir in [location.join(METADATA_DIR), location.join(DATA_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| ReplicatorError::io(&dir, e))?;
        }

        let last_column_id = schema.highest_field_id();
        let mut metadata =
            TableMetadata::new(&location.to_string_lossy(), schema, last_column_id);
        if !partition_columns.is_empty() {
            metadata.set_identity_partitioning(partition_columns)?;
        }
        metadata.validate()?;

        let metadata_path = self.metadata_path(name, 1);
        if !write_exclusive(&metadata_path, &metadata.to_json()?)? {
            return Err(ReplicatorError::TableAlreadyExists(name.to_string()));
        }
        write_atomic(&self.pointer_path(name), b"1")?;

        tracing::info!(
            "Created table '{}' at {}",
            sanitize_identifier(name),
            location.display()
        );
        Ok(LoadedTable {
            name: name.to_string(),
            location,
            version: 1,
            metadata,
        })
    }

    /// Write every file of a commit and its metadata version, without moving the pointer.
    ///
    /// Fails with `ConcurrentCommitConflict` when the pointer is no longer at
    /// `table.version`.
    pub fn stage(&self, table: &LoadedTable, pending: PendingCommit) -> Result<StagedCommit> {
        let name = table.name.as_str();
        let actual = self.current_version(name)?;
        if actual != table.version {
            return Err(ReplicatorError::ConcurrentCommitConflict {
                table: name.to_string(),
                expected: table.version,
                actual,
            });
        }
        if pending.data_files.is_empty() && pending.schema_update.is_none() {
            return Err(ReplicatorError::InvalidData(format!(
                "nothing to commit for table '{}'",
                sanitize_identifier(name)
            )));
        }

        let mut metadata = table.metadata.clone();
        let previous_updated_ms = metadata.last_updated_ms;
        if let Some(update) = pending.schema_update {
            metadata.add_schema(update.schema, update.last_column_id);
        }
        check_partition_tuples(name, &metadata, &pending.data_files)?;

        if !pending.data_files.is_empty() {
            let snapshot = self.write_snapshot_files(table, &metadata, &pending.data_files)?;
            metadata.add_snapshot(snapshot);
        } else {
            metadata.last_updated_ms = now_ms();
        }

        metadata.metadata_log.push(MetadataLogEntry {
            metadata_file: self
                .metadata_path(name, table.version)
                .to_string_lossy()
                .into_owned(),
            timestamp_ms: previous_updated_ms,
        });
        metadata.validate()?;

        let new_version = table.version + 1;
        let metadata_path = self.metadata_path(name, new_version);
        let staged_path = self.table_location(name).join(METADATA_DIR).join(format!(
            "v{}-{}{}",
            new_version,
            Uuid::new_v4(),
            STAGED_SUFFIX
        ));
        write_atomic(&staged_path, &metadata.to_json()?)?;

        Ok(StagedCommit {
            table: LoadedTable {
                name: table.name.clone(),
                location: table.location.clone(),
                version: new_version,
                metadata,
            },
            metadata_path,
            staged_path,
        })
    }

    /// Make a staged commit visible: claim `v<N+1>` no-clobber, then swap the pointer.
    ///
    /// Fails with `ConcurrentCommitConflict` when the pointer moved or another
    /// writer claimed the version first. A claimed version whose pointer stays
    /// at `N` was left by a writer that died inside publish and is reported as
    /// `CorruptCatalog` until `remove_uncommitted_metadata` runs.
    pub fn publish(&self, staged: StagedCommit) -> Result<LoadedTable> {
        let name = staged.table.name.as_str();
        let expected = staged.table.version - 1;
        let actual = self.current_version(name)?;
        if actual != expected {
            return Err(ReplicatorError::ConcurrentCommitConflict {
                table: name.to_string(),
                expected,
                actual,
            });
        }

        // Another writer that claimed the version moves the pointer right after;
        // a claim that never moves it was left by a writer that died in between.
        let deadline = Instant::now() + CLAIM_SETTLE_TIMEOUT;
        while !link_exclusive(&staged.staged_path, &staged.metadata_path)? {
            let actual = self.current_version(name)?;
            if actual != expected {
                return Err(ReplicatorError::ConcurrentCommitConflict {
                    table: name.to_string(),
                    expected,
                    actual,
                });
            }
            if Instant::now() >= deadline {
                return Err(ReplicatorError::CorruptCatalog {
                    table: name.to_string(),
                    message: format!(
                        "{} exists but the pointer is still at version {}; run `repair` if no other writer is active",
                        staged.metadata_path.display(),
                        expected
                    ),
                });
            }
            thread::sleep(CLAIM_POLL_INTERVAL);
        }

        if let Err(e) = write_atomic(
            &self.pointer_path(name),
            staged.table.version.to_string().as_bytes(),
        ) {
            // Release the claimed version so the table is not left blocked
            if let Err(remove) = fs::remove_file(&staged.metadata_path) {
                tracing::warn!(
                    "Failed to release {}: {}",
                    staged.metadata_path.display(),
                    remove
                );
            }
            return Err(e);
        }

        tracing::info!(
            "Committed '{}' version {} (snapshot {:?})",
            sanitize_identifier(name),
            staged.table.version,
            staged.table.metadata.current_snapshot_id
        );
        Ok(staged.table.clone())
    }

    fn write_snapshot_files(
        &self,
        table: &LoadedTable,
        metadata: &TableMetadata,
        data_files: &[DataFile],
    ) -> Result<Snapshot> {
        let schema = metadata.current_schema()?;
        let spec = metadata.default_partition_spec()?;
        let snapshot_id = metadata.new_snapshot_id();
        let sequence_number = metadata.last_sequence_number + 1;
        let parent = metadata.current_snapshot();
        let metadata_dir = table.metadata_dir();

        let manifest_path = metadata_dir.join(format!("{}-m0.avro", Uuid::new_v4()));
        let new_manifest = ManifestWriter::new(schema, spec, snapshot_id, sequence_number)
            .write(&manifest_path, data_files)?;

        let mut manifests = match parent {
            Some(p) => read_manifest_list(Path::new(&p.manifest_list))?,
            None => Vec::new(),
        };
        manifests.push(new_manifest);

        let manifest_list_path = metadata_dir.join(format!(
            "snap-{}-1-{}.avro",
            snapshot_id,
            Uuid::new_v4()
        ));
        ManifestListWriter::new(snapshot_id, parent.map(|p| p.snapshot_id), sequence_number)
            .write(&manifest_list_path, &manifests)?;

        Ok(Snapshot {
            snapshot_id,
            parent_snapshot_id: parent.map(|p| p.snapshot_id),
            sequence_number,
            timestamp_ms: now_ms(),
            manifest_list: manifest_list_path.to_string_lossy().into_owned(),
            summary: append_summary(parent, data_files),
            schema_id: Some(schema.schema_id),
        })
    }

    /// Live manifest entries reachable from a snapshot.
    pub fn snapshot_entries(
        &self,
        table: &LoadedTable,
        snapshot_id: i64,
    ) -> Result<Vec<ManifestEntry>> {
        let snapshot = table.metadata.snapshot_by_id(snapshot_id).ok_or_else(|| {
            ReplicatorError::CorruptCatalog {
                table: table.name.clone(),
                message: format!("snapshot {} not found", snapshot_id),
            }
        })?;
        let schema = table.current_schema()?;

        let mut entries = Vec::new();
        for manifest in read_manifest_list(Path::new(&snapshot.manifest_list))? {
            let spec = table
                .metadata
                .partition_specs
                .iter()
                .find(|s| s.spec_id == manifest.partition_spec_id)
                .ok_or_else(|| ReplicatorError::CorruptCatalog {
                    table: table.name.clone(),
                    message: format!("partition spec {} not found", manifest.partition_spec_id),
                })?;
            let partition_types = spec.partition_types(schema)?;
            entries.extend(
                read_manifest(Path::new(&manifest.manifest_path), &partition_types)?
                    .into_iter()
                    .filter(|e| e.status != ManifestStatus::Deleted),
            );
        }
        Ok(entries)
    }

    /// All rows visible in the current snapshot, in current-schema field order.
    pub fn scan(&self, table: &LoadedTable) -> Result<Vec<Row>> {
        let Some(snapshot_id) = table.current_snapshot_id() else {
            return Ok(Vec::new());
        };
        let schema = table.current_schema()?;
        let mut rows = Vec::new();
        for entry in self.snapshot_entries(table, snapshot_id)? {
            rows.extend(read_data_file(Path::new(&entry.data_file.file_path), schema)?);
        }
        Ok(rows)
    }

    /// Metadata left behind by commits that never published: versions above
    /// the pointer, plus staged files of writers that died before dropping them.
    pub fn uncommitted_metadata(&self, name: &str) -> Result<Vec<PathBuf>> {
        let current = self.current_version(name)?;
        let dir = self.table_location(name).join(METADATA_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| ReplicatorError::io(&dir, e))?;

        let mut orphans: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ReplicatorError::io(&dir, e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = file_name.strip_prefix('v') else {
                continue;
            };
            if let Some(staged) = rest.strip_suffix(STAGED_SUFFIX) {
                let version = staged
                    .split('-')
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                orphans.push((version, entry.path()));
            } else if let Some(version) = rest
                .strip_suffix(".metadata.json")
                .and_then(|v| v.parse::<u64>().ok())
            {
                if version > current {
                    orphans.push((version, entry.path()));
                }
            }
        }
        orphans.sort();
        Ok(orphans.into_iter().map(|(_, path)| path).collect())
    }

    /// Delete uncommitted metadata files so the next commit can claim their version.
    ///
    /// Only safe when no other writer is mid-commit on this table.
    pub fn remove_uncommitted_metadata(&self, name: &str) -> Result<Vec<PathBuf>> {
        let orphans = self.uncommitted_metadata(name)?;
        for path in &orphans {
            fs::remove_file(path).map_err(|e| ReplicatorError::io(path, e))?;
            tracing::warn!("Removed uncommitted metadata {}", path.display());
        }
        Ok(orphans)
    }
}

impl TableCatalog for FilesystemCatalog {
    fn exists(&self, name: &str) -> bool {
        self.pointer_path(name).is_file()
    }

    fn create(&self, name: &str, schema: TableSchema) -> Result<LoadedTable> {
        self.create_with_partitioning(name, schema, &[])
    }

    fn load(&self, name: &str) -> Result<LoadedTable> {
        validate_table_name(name)?;
        let version = self.current_version(name)?;
        let path = self.metadata_path(name, version);

        let bytes = fs::read(&path).map_err(|e| ReplicatorError::CorruptCatalog {
            table: name.to_string(),
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let metadata =
            TableMetadata::from_json(&bytes).map_err(|e| ReplicatorError::CorruptCatalog {
                table: name.to_string(),
                message: format!("malformed {}: {}", path.display(), e),
            })?;

        tracing::debug!(
            "Loaded '{}' version {} (snapshot {:?})",
            sanitize_identifier(name),
            version,
            metadata.current_snapshot_id
        );
        Ok(LoadedTable {
            name: name.to_string(),
            location: self.table_location(name),
            version,
            metadata,
        })
    }

    fn commit(&self, table: &LoadedTable, pending: PendingCommit) -> Result<LoadedTable> {
        let staged = self.stage(table, pending)?;
        self.publish(staged)
    }

    /// Rows of the data files added by `snapshot_id`.
    fn read_snapshot_rows(&self, table: &LoadedTable, snapshot_id: i64) -> Result<Vec<Row>> {
        let schema = table.current_schema()?;
        let mut rows = Vec::new();
        for entry in self.snapshot_entries(table, snapshot_id)? {
            if entry.status == ManifestStatus::Added && entry.snapshot_id == Some(snapshot_id) {
                rows.extend(read_data_file(
                    Path::new(&entry.data_file.file_path),
                    schema,
                )?);
            }
        }
        Ok(rows)
    }
}

/// Every data file must carry one value per partition field, typed like its source.
fn check_partition_tuples(
    name: &str,
    metadata: &TableMetadata,
    data_files: &[DataFile],
) -> Result<()> {
    let spec = metadata.default_partition_spec()?;
    let types = spec.partition_types(metadata.current_schema()?)?;
    for file in data_files {
        if file.partition.len() != types.len() {
            return Err(ReplicatorError::InvalidData(format!(
                "data file {} of table '{}' has {} partition values but spec {} has {} fields",
                file.file_path,
                sanitize_identifier(name),
                file.partition.len(),
                spec.spec_id,
                types.len()
            )));
        }
        if let Some((value, ty)) = file
            .partition
            .iter()
            .zip(types.iter())
            .find(|(value, ty)| !value.conforms_to(ty))
        {
            return Err(ReplicatorError::InvalidData(format!(
                "data file {} of table '{}' has partition value {} that is not a {}",
                file.file_path,
                sanitize_identifier(name),
                value,
                ty
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iceberg::data_file::{ColumnarFileWriter, DataFileWriterConfig};
    use crate::iceberg::types::{FieldDescriptor, PrimitiveType, Value};
    use tempfile::TempDir;

    fn schema() -> TableSchema {
        TableSchema::new(
            0,
            vec![
                FieldDescriptor::new(1, "id", PrimitiveType::Long, true),
                FieldDescriptor::new(2, "name", PrimitiveType::String, false),
            ],
        )
    }

    fn write_rows(table: &LoadedTable, ids: std::ops::Range<i64>) -> Vec<DataFile> {
        let mut writer = ColumnarFileWriter::new(
            &table.data_dir(),
            table.current_schema().unwrap(),
            DataFileWriterConfig::default(),
        )
        .unwrap();
        for id in ids {
            writer
                .write_row(vec![Value::Long(id), Value::String(format!("n{}", id))])
                .unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_create_then_load() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();

        let created = catalog.create("orders", schema()).unwrap();
        assert_eq!(created.version, 1);
        assert!(catalog.exists("orders"));

        let loaded = catalog.load("orders").unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.metadata, created.metadata);
        assert!(loaded.metadata.snapshots.is_empty());
        assert_eq!(catalog.list_tables().unwrap(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        catalog.create("orders", schema()).unwrap();
        let err = catalog.create("orders", schema()).unwrap_err();
        assert!(matches!(err, ReplicatorError::TableAlreadyExists(_)));
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        assert!(matches!(
            catalog.load("nope").unwrap_err(),
            ReplicatorError::TableNotFound(_)
        ));

        catalog.create("orders", schema()).unwrap();
        fs::write(catalog.pointer_path("orders"), "7").unwrap();
        assert!(matches!(
            catalog.load("orders").unwrap_err(),
            ReplicatorError::CorruptCatalog { .. }
        ));

        fs::write(catalog.pointer_path("orders"), "garbage").unwrap();
        assert!(matches!(
            catalog.load("orders").unwrap_err(),
            ReplicatorError::CorruptCatalog { .. }
        ));
    }

    #[test]
    fn test_commit_appends_snapshot_and_carries_manifests() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        let table = catalog.create("orders", schema()).unwrap();

        let files = write_rows(&table, 0..3);
        let v2 = catalog
            .commit(
                &table,
                PendingCommit {
                    data_files: files,
                    schema_update: None,
                },
            )
            .unwrap();
        let first = v2.current_snapshot_id().unwrap();

        let files = write_rows(&v2, 3..5);
        let v3 = catalog
            .commit(
                &v2,
                PendingCommit {
                    data_files: files,
                    schema_update: None,
                },
            )
            .unwrap();
        let second = v3.current_snapshot_id().unwrap();

        assert_eq!(v3.version, 3);
        assert_eq!(v3.metadata.snapshots.len(), 2);
        let snap = v3.metadata.current_snapshot().unwrap();
        assert_eq!(snap.parent_snapshot_id, Some(first));
        assert_eq!(snap.sequence_number, 2);
        assert_eq!(snap.summary["total-records"], "5");
        assert_eq!(v3.metadata.metadata_log.len(), 2);

        let manifests = read_manifest_list(Path::new(&snap.manifest_list)).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].added_snapshot_id, first);

        assert_eq!(catalog.read_snapshot_rows(&v3, second).unwrap().len(), 2);
        assert_eq!(catalog.read_snapshot_rows(&v3, first).unwrap().len(), 3);
        assert_eq!(catalog.scan(&v3).unwrap().len(), 5);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        let table = catalog.create("orders", schema()).unwrap();

        let files = write_rows(&table, 0..1);
        catalog
            .commit(
                &table,
                PendingCommit {
                    data_files: files.clone(),
                    schema_update: None,
                },
            )
            .unwrap();

        let err = catalog
            .commit(
                &table,
                PendingCommit {
                    data_files: files,
                    schema_update: None,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicatorError::ConcurrentCommitConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_staged_commit_invisible_until_published() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        let table = catalog.create("orders", schema()).unwrap();

        let staged = catalog
            .stage(
                &table,
                PendingCommit {
                    data_files: write_rows(&table, 0..2),
                    schema_update: None,
                },
            )
            .unwrap();
        assert_eq!(catalog.load("orders").unwrap().version, 1);
        assert!(!staged.metadata_path().exists());
        assert_eq!(
            catalog.uncommitted_metadata("orders").unwrap(),
            vec![staged.staged_path().to_path_buf()]
        );

        let published = catalog.publish(staged).unwrap();
        assert_eq!(published.version, 2);
        assert_eq!(catalog.load("orders").unwrap().version, 2);
        assert!(catalog.uncommitted_metadata("orders").unwrap().is_empty());
    }

    #[test]
    fn test_dropped_stage_does_not_block_next_commit() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        let table = catalog.create("orders", schema()).unwrap();

        let staged = catalog
            .stage(
                &table,
                PendingCommit {
                    data_files: write_rows(&table, 0..2),
                    schema_update: None,
                },
            )
            .unwrap();
        drop(staged);
        assert!(catalog.uncommitted_metadata("orders").unwrap().is_empty());

        let committed = catalog
            .commit(
                &table,
                PendingCommit {
                    data_files: write_rows(&table, 2..5),
                    schema_update: None,
                },
            )
            .unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(catalog.scan(&committed).unwrap().len(), 3);
    }

    #[test]
    fn test_leaked_staged_file_is_listed_but_not_blocking() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        let table = catalog.create("orders", schema()).unwrap();

        // A writer killed after staging never runs its cleanup
        let staged = catalog
            .stage(
                &table,
                PendingCommit {
                    data_files: write_rows(&table, 0..2),
                    schema_update: None,
                },
            )
            .unwrap();
        let leaked = staged.staged_path().to_path_buf();
        std::mem::forget(staged);

        let committed = catalog
            .commit(
                &table,
                PendingCommit {
                    data_files: write_rows(&table, 2..3),
                    schema_update: None,
                },
            )
            .unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(catalog.uncommitted_metadata("orders").unwrap(), vec![leaked.clone()]);
        assert_eq!(catalog.remove_uncommitted_metadata("orders").unwrap(), vec![leaked]);
    }

    #[test]
    fn test_unpublished_claim_reported_until_repaired() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        let table = catalog.create("orders", schema()).unwrap();

        // Claim v2 without moving the pointer, as a writer dying inside publish would
        let staged = catalog
            .stage(
                &table,
                PendingCommit {
                    data_files: write_rows(&table, 0..1),
                    schema_update: None,
                },
            )
            .unwrap();
        fs::copy(staged.staged_path(), staged.metadata_path()).unwrap();
        drop(staged);

        let pending = PendingCommit {
            data_files: write_rows(&table, 1..2),
            schema_update: None,
        };
        let err = catalog.commit(&table, pending.clone()).unwrap_err();
        assert!(matches!(err, ReplicatorError::CorruptCatalog { .. }), "{}", err);
        assert!(!err.is_retryable());
        assert_eq!(catalog.load("orders").unwrap().version, 1);

        assert_eq!(catalog.remove_uncommitted_metadata("orders").unwrap().len(), 1);
        assert_eq!(catalog.commit(&table, pending).unwrap().version, 2);
    }

    #[test]
    fn test_empty_commit_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = FilesystemCatalog::new(dir.path()).unwrap();
        let table = catalog.create("orders", schema()).unwrap();
        assert!(catalog.commit(&table, PendingCommit::default()).is_err());
    }
}
