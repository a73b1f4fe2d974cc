// ABOUTME: Utility functions for identifier quoting and crash-safe file writes
// ABOUTME: Provides temp-file-then-rename and no-clobber publishing used by catalog and watermarks

use std::fs;
use std::io::Write;
use std::path::Path;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tempfile::NamedTempFile;

use crate::error::{ReplicatorError, Result};

/// Sanitize an identifier (table name, schema name, etc.) for display
///
/// Removes control characters and limits length to prevent log injection attacks
/// and ensure readable error messages.
///
/// # Examples
///
/// ```
/// # use iceberg_replicator::utils::sanitize_identifier;
/// assert_eq!(sanitize_identifier("normal_table"), "normal_table");
/// assert_eq!(sanitize_identifier("table\x00name"), "tablename");
/// let long_name = "a".repeat(200);
/// assert_eq!(sanitize_identifier(&long_name).len(), 100);
/// ```
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a SQL identifier (table, column)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Bytes kept verbatim in file stems; everything else, `%` included, is escaped.
const FILE_STEM_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'_').remove(b'-');

/// Map an arbitrary identifier (e.g. `main.orders`) to a safe file stem.
///
/// Percent-encoding keeps the mapping one-to-one, so distinct identifiers
/// never share a file.
///
/// ```
/// # use iceberg_replicator::utils::file_stem_for;
/// assert_eq!(file_stem_for("main.orders"), "main.orders");
/// assert_eq!(file_stem_for("sales q1"), "sales%20q1");
/// assert_eq!(file_stem_for("sales_q1"), "sales_q1");
/// assert_eq!(file_stem_for("100%"), "100%25");
/// ```
pub fn file_stem_for(identifier: &str) -> String {
    utf8_percent_encode(identifier, FILE_STEM_ESCAPES).to_string()
}

/// Validate a table-format table name: it becomes a directory under the warehouse.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ReplicatorError::Config(
            "table name cannot be empty".to_string(),
        ));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(ReplicatorError::Config(format!(
            "table name '{}' must not contain path separators",
            sanitize_identifier(name)
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ReplicatorError::Config(
            "table name contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Write `contents` to `path` atomically.
///
/// The bytes go to a temp file in the same directory, are flushed to disk, and
/// the temp file is renamed over `path`. Readers see either the old file or the
/// new one, never a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = write_temp_sibling(path, contents)?;
    let tmp_path = tmp.path().to_path_buf();
    tmp.persist(path)
        .map_err(|e| rename_error(e.error, &tmp_path, path))?;
    sync_parent_dir(path);
    Ok(())
}

/// Write `contents` to `path` only if `path` does not exist yet.
///
/// Returns `Ok(false)` when another writer already created `path`. The file
/// appears fully written or not at all.
pub fn write_exclusive(path: &Path, contents: &[u8]) -> Result<bool> {
    let tmp = write_temp_sibling(path, contents)?;
    let tmp_path = tmp.path().to_path_buf();
    match tmp.persist_noclobber(path) {
        Ok(_) => {
            sync_parent_dir(path);
            Ok(true)
        }
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(rename_error(e.error, &tmp_path, path)),
    }
}

/// Give the existing file `from` the additional name `to`, only if `to` is free.
///
/// Returns `Ok(false)` when `to` already exists. `from` is left in place.
pub fn link_exclusive(from: &Path, to: &Path) -> Result<bool> {
    match fs::hard_link(from, to) {
        Ok(()) => {
            sync_parent_dir(to);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(rename_error(e, from, to)),
    }
}

fn write_temp_sibling(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let dir = path.parent().ok_or_else(|| {
        ReplicatorError::Config(format!("{:?} has no parent directory", path))
    })?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| ReplicatorError::io(dir, e))?;
    tmp.write_all(contents)
        .map_err(|e| ReplicatorError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ReplicatorError::io(tmp.path(), e))?;
    Ok(tmp)
}

fn rename_error(error: std::io::Error, from: &Path, to: &Path) -> ReplicatorError {
    if is_cross_device(&error) {
        ReplicatorError::CrossDeviceRename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }
    } else {
        ReplicatorError::io(to, error)
    }
}

#[cfg(unix)]
fn is_cross_device(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_error: &std::io::Error) -> bool {
    false
}

/// Flush the directory entry so a completed rename survives a crash.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            tracing::debug!("Failed to sync directory {:?}: {}", dir, e);
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("my\"table"), "\"my\"\"table\"");
    }

    #[test]
    fn test_file_stem_for_is_one_to_one() {
        let names = ["sales q1", "sales_q1", "sales%20q1", "sales/q1", "Sales q1"];
        let stems: std::collections::HashSet<String> =
            names.iter().map(|n| file_stem_for(n)).collect();
        assert_eq!(stems.len(), names.len());
        assert_eq!(file_stem_for("sales/q1"), "sales%2Fq1");
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("orders").is_ok());
        assert!(validate_table_name("main.orders").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("..").is_err());
        assert!(validate_table_name("a/b").is_err());
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("version-hint.txt");

        write_atomic(&path, b"1").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");

        write_atomic(&path, b"2").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "2");

        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_exclusive_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2.metadata.json");

        assert!(write_exclusive(&path, b"first").unwrap());
        assert!(!write_exclusive(&path, b"second").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
    }

    #[test]
    fn test_link_exclusive_keeps_existing_target() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("v2-a.staged.json");
        let other = dir.path().join("v2-b.staged.json");
        let target = dir.path().join("v2.metadata.json");
        fs::write(&staged, b"first").unwrap();
        fs::write(&other, b"second").unwrap();

        assert!(link_exclusive(&staged, &target).unwrap());
        assert!(!link_exclusive(&other, &target).unwrap());
        assert_eq!(fs::read_to_string(&target).unwrap(), "first");
        assert!(staged.exists());
    }
}
