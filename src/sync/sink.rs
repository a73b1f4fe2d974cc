// ABOUTME: DestinationSink contract and the SQLite destination used by sync jobs
// ABOUTME: Applies snapshot rows with INSERT ... ON CONFLICT DO UPDATE or plain inserts

use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::types::{PrimitiveType, Row, TableSchema, Value};
use crate::utils::quote_ident;

/// SQLite's default limit on bound parameters per statement (3.32+).
const MAX_PARAMS: usize = 32_000;

/// Where a sync cycle merges committed rows.
pub trait DestinationSink {
    /// Create the destination table if missing and add columns the schema gained.
    fn prepare(&mut self, schema: &TableSchema, primary_key: &[String]) -> Result<()>;

    /// Insert rows, replacing existing rows with the same primary key.
    fn apply_upsert(
        &mut self,
        schema: &TableSchema,
        rows: &[Row],
        primary_key: &[String],
    ) -> Result<u64>;

    /// Insert rows unconditionally.
    fn apply_append(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<u64>;
}

/// Writes into one table of a SQLite database.
pub struct SqliteSink {
    conn: Connection,
    table: String,
}

impl SqliteSink {
    /// Open (creating if needed) the destination database.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| ReplicatorError::DestinationWrite {
            table: table.to_string(),
            message: format!("cannot open {}: {}", path.display(), e),
        })?;
        Ok(Self::from_connection(conn, table))
    }

    pub fn from_connection(conn: Connection, table: &str) -> Self {
        Self {
            conn,
            table: table.to_string(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn write_error(&self, e: impl std::fmt::Display) -> ReplicatorError {
        ReplicatorError::DestinationWrite {
            table: self.table.clone(),
            message: e.to_string(),
        }
    }

    fn existing_columns(&self) -> Result<Vec<String>> {
        let query = format!("PRAGMA table_info({})", quote_ident(&self.table));
        let mut stmt = self.conn.prepare(&query).map_err(|e| self.write_error(e))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| self.write_error(e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| self.write_error(e))?;
        Ok(names)
    }

    /// Run `query` once per chunk inside one transaction.
    fn execute_batches(
        &mut self,
        schema: &TableSchema,
        rows: &[Row],
        build: impl Fn(usize) -> String,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let width = schema.fields.len().max(1);
        let batch_size = std::cmp::max(1, MAX_PARAMS / width);
        let table = self.table.clone();
        let to_err = |e: rusqlite::Error| ReplicatorError::DestinationWrite {
            table: table.clone(),
            message: e.to_string(),
        };

        let tx = self.conn.transaction().map_err(&to_err)?;
        let mut affected = 0u64;
        for chunk in rows.chunks(batch_size) {
            for row in chunk {
                if row.len() != schema.fields.len() {
                    return Err(ReplicatorError::InvalidData(format!(
                        "row has {} values but '{}' has {} columns",
                        row.len(),
                        table,
                        schema.fields.len()
                    )));
                }
            }
            let query = build(chunk.len());
            let params: Vec<SqlValue> = chunk.iter().flatten().map(value_to_sql).collect();
            let mut stmt = tx.prepare_cached(&query).map_err(&to_err)?;
            affected += stmt
                .execute(rusqlite::params_from_iter(params.iter()))
                .map_err(&to_err)? as u64;
        }
        tx.commit().map_err(&to_err)?;
        Ok(affected)
    }
}

impl DestinationSink for SqliteSink {
    fn prepare(&mut self, schema: &TableSchema, primary_key: &[String]) -> Result<()> {
        for key in primary_key {
            if schema.field_by_name(key).is_none() {
                return Err(ReplicatorError::Config(format!(
                    "primary key column '{}' is not in the table schema",
                    key
                )));
            }
        }

        let existing = self.existing_columns()?;
        if existing.is_empty() {
            let query = build_create_table_query(&self.table, schema, primary_key);
            tracing::info!("Creating destination table '{}'", self.table);
            self.conn
                .execute_batch(&query)
                .map_err(|e| self.write_error(e))?;
            return Ok(());
        }

        for field in &schema.fields {
            if existing.iter().any(|c| c == &field.name) {
                continue;
            }
            tracing::info!(
                "Adding column '{}' to destination table '{}'",
                field.name,
                self.table
            );
            let query = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(&self.table),
                quote_ident(&field.name),
                sqlite_column_type(&field.field_type)
            );
            self.conn
                .execute_batch(&query)
                .map_err(|e| self.write_error(e))?;
        }
        Ok(())
    }

    fn apply_upsert(
        &mut self,
        schema: &TableSchema,
        rows: &[Row],
        primary_key: &[String],
    ) -> Result<u64> {
        if primary_key.is_empty() {
            return Err(ReplicatorError::Config(
                "upsert requires at least one primary key column".to_string(),
            ));
        }
        let columns = schema.column_names();
        let table = self.table.clone();
        let affected = self.execute_batches(schema, rows, |n| {
            build_upsert_query(&table, primary_key, &columns, n)
        })?;
        tracing::debug!("Upserted {} rows into '{}'", affected, self.table);
        Ok(affected)
    }

    fn apply_append(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<u64> {
        let columns = schema.column_names();
        let table = self.table.clone();
        let affected =
            self.execute_batches(schema, rows, |n| build_insert_query(&table, &columns, n))?;
        tracing::debug!("Appended {} rows into '{}'", affected, self.table);
        Ok(affected)
    }
}

fn values_clause(num_cols: usize, num_rows: usize) -> String {
    (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("?{}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build an upsert for `num_rows` rows.
///
/// ```sql
/// INSERT INTO "orders" ("id", "total") VALUES (?1, ?2), (?3, ?4)
/// ON CONFLICT ("id") DO UPDATE SET "total" = excluded."total"
/// ```
fn build_upsert_query(
    table: &str,
    primary_key_columns: &[String],
    all_columns: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = all_columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_pk_columns: Vec<String> =
        primary_key_columns.iter().map(|c| quote_ident(c)).collect();

    let update_columns: Vec<String> = all_columns
        .iter()
        .filter(|c| !primary_key_columns.contains(c))
        .map(|c| format!("{} = excluded.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        // Every column is part of the key
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(table),
        quoted_columns.join(", "),
        values_clause(all_columns.len(), num_rows),
        quoted_pk_columns.join(", "),
        update_clause
    )
}

fn build_insert_query(table: &str, all_columns: &[String], num_rows: usize) -> String {
    let quoted_columns: Vec<String> = all_columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        quoted_columns.join(", "),
        values_clause(all_columns.len(), num_rows)
    )
}

fn build_create_table_query(table: &str, schema: &TableSchema, primary_key: &[String]) -> String {
    let mut definitions: Vec<String> = schema
        .fields
        .iter()
        .map(|field| {
            let not_null = if field.required { " NOT NULL" } else { "" };
            format!(
                "{} {}{}",
                quote_ident(&field.name),
                sqlite_column_type(&field.field_type),
                not_null
            )
        })
        .collect();
    if !primary_key.is_empty() {
        let keys: Vec<String> = primary_key.iter().map(|c| quote_ident(c)).collect();
        definitions.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        definitions.join(", ")
    )
}

/// Declared SQLite type that reads back as the same table-format type.
fn sqlite_column_type(ty: &PrimitiveType) -> String {
    match ty {
        PrimitiveType::Boolean => "BOOLEAN".to_string(),
        PrimitiveType::Int => "INT".to_string(),
        PrimitiveType::Long => "BIGINT".to_string(),
        PrimitiveType::Float => "REAL".to_string(),
        PrimitiveType::Double => "DOUBLE".to_string(),
        PrimitiveType::Decimal { precision, scale } => format!("DECIMAL({},{})", precision, scale),
        PrimitiveType::Date => "DATE".to_string(),
        PrimitiveType::Time => "TIME".to_string(),
        PrimitiveType::Timestamp => "DATETIME".to_string(),
        PrimitiveType::Timestamptz => "TIMESTAMPTZ".to_string(),
        PrimitiveType::String => "TEXT".to_string(),
        PrimitiveType::Uuid => "UUID".to_string(),
        PrimitiveType::Fixed(_) | PrimitiveType::Binary => "BLOB".to_string(),
    }
}

/// Convert a table-format value to a SQLite value.
///
/// Temporal values are stored as ISO-8601 text, decimals as their exact
/// decimal string.
pub fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(*b as i64),
        Value::Int(i) => SqlValue::Integer(*i as i64),
        Value::Long(l) => SqlValue::Integer(*l),
        Value::Float(f) => SqlValue::Real(*f as f64),
        Value::Double(d) => SqlValue::Real(*d),
        Value::Decimal(d) => SqlValue::Text(d.to_string()),
        Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Value::Time(t) => SqlValue::Text(t.format("%H:%M:%S%.f").to_string()),
        Value::Timestamp(ts) => SqlValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::Timestamptz(ts) => SqlValue::Text(
            ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        ),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Uuid(u) => SqlValue::Text(u.hyphenated().to_string()),
        Value::Fixed(b) | Value::Binary(b) => SqlValue::Blob(b.clone()),
    }
}
