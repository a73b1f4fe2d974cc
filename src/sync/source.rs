// ABOUTME: RowSource contract and the SQLite-backed source used by sync jobs
// ABOUTME: Lazily pages through matching rows by rowid and converts them to typed values

use std::collections::VecDeque;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::schema::{map_native_type, SourceColumn};
use crate::iceberg::types::{rescale_decimal, PrimitiveType, Row, Value};
use crate::sync::change_detection::ExtractionPredicate;
use crate::sync::watermark::WatermarkValue;
use crate::utils::quote_ident;

/// Lazily produced rows, in the source's column order.
pub type RowStream<'a> = Box<dyn Iterator<Item = Result<Row>> + 'a>;

/// Where a sync cycle reads changed rows from.
pub trait RowSource {
    /// Name of the source table (for logs and errors).
    fn table(&self) -> &str;

    /// Column metadata in the order `extract` yields values.
    fn columns(&self) -> Result<Vec<SourceColumn>>;

    /// Stream rows matching `predicate`.
    fn extract(&self, predicate: &ExtractionPredicate) -> Result<RowStream<'_>>;
}

/// Reads one table of a SQLite database.
///
/// Rows are paged by rowid, so `WITHOUT ROWID` tables are not supported.
pub struct SqliteSource {
    conn: Connection,
    table: String,
    batch_size: usize,
}

impl SqliteSource {
    /// Open `path` read-only.
    pub fn open(path: &Path, table: &str, batch_size: usize) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| extraction(table, format!("cannot open {}: {}", path.display(), e)))?;
        Self::from_connection(conn, table, batch_size)
    }

    /// Wrap an existing connection (used with in-memory databases).
    pub fn from_connection(conn: Connection, table: &str, batch_size: usize) -> Result<Self> {
        if table.is_empty() || table.chars().any(|c| c.is_control()) {
            return Err(ReplicatorError::Config(format!(
                "invalid source table name {:?}",
                table
            )));
        }
        Ok(Self {
            conn,
            table: table.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn extraction(table: &str, message: impl Into<String>) -> ReplicatorError {
    ReplicatorError::Extraction {
        table: table.to_string(),
        message: message.into(),
    }
}

/// SQLite stores every INTEGER column as a 64-bit value.
fn sqlite_native_type(declared: &str) -> String {
    match declared.trim().to_ascii_lowercase().as_str() {
        "integer" | "int" => "BIGINT".to_string(),
        _ => declared.to_string(),
    }
}

impl RowSource for SqliteSource {
    fn table(&self) -> &str {
        &self.table
    }

    fn columns(&self) -> Result<Vec<SourceColumn>> {
        let query = format!("PRAGMA table_info({})", quote_ident(&self.table));
        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|e| extraction(&self.table, e.to_string()))?;
        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                let not_null: i64 = row.get(3)?;
                let pk: i64 = row.get(5)?;
                Ok(SourceColumn {
                    name,
                    native_type: sqlite_native_type(&declared),
                    nullable: not_null == 0 && pk == 0,
                })
            })
            .map_err(|e| extraction(&self.table, e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| extraction(&self.table, e.to_string()))?;

        if columns.is_empty() {
            return Err(extraction(&self.table, "table does not exist"));
        }
        Ok(columns)
    }

    fn extract(&self, predicate: &ExtractionPredicate) -> Result<RowStream<'_>> {
        let columns = self.columns()?;
        let mut types = Vec::with_capacity(columns.len());
        for column in &columns {
            types.push(map_native_type(column)?);
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let (filter_sql, bound, filter) = match predicate {
            ExtractionPredicate::All => (String::new(), None, None),
            ExtractionPredicate::GreaterThan { column, value } => {
                let idx = columns.iter().position(|c| &c.name == column).ok_or_else(|| {
                    extraction(
                        &self.table,
                        format!("watermark column '{}' not found", column),
                    )
                })?;
                match value {
                    WatermarkValue::Integer(i) => (
                        format!(" AND {} > ?3", quote_ident(column)),
                        Some(SqlValue::Integer(*i)),
                        Some((idx, *value)),
                    ),
                    // SQLite date functions resolve to milliseconds, so the SQL
                    // bound is inclusive and the exact comparison happens below.
                    WatermarkValue::Timestamp(ts) => (
                        format!(" AND julianday({}) >= julianday(?3)", quote_ident(column)),
                        Some(SqlValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
                        Some((idx, *value)),
                    ),
                }
            }
        };

        let query = format!(
            "SELECT rowid, {} FROM {} WHERE rowid > ?1{} ORDER BY rowid LIMIT ?2",
            column_list,
            quote_ident(&self.table),
            filter_sql
        );
        tracing::debug!("Extracting from '{}': {}", self.table, query);

        Ok(Box::new(SqliteRowStream {
            source: self,
            query,
            bound,
            filter,
            columns,
            types,
            last_rowid: i64::MIN,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }
}

struct SqliteRowStream<'a> {
    source: &'a SqliteSource,
    query: String,
    bound: Option<SqlValue>,
    filter: Option<(usize, WatermarkValue)>,
    columns: Vec<SourceColumn>,
    types: Vec<PrimitiveType>,
    last_rowid: i64,
    buffer: VecDeque<Row>,
    exhausted: bool,
}

impl SqliteRowStream<'_> {
    fn fetch_batch(&mut self) -> Result<()> {
        let source = self.source;
        let table = source.table.as_str();
        let mut stmt = source
            .conn
            .prepare_cached(&self.query)
            .map_err(|e| extraction(table, e.to_string()))?;

        let batch_size = source.batch_size as i64;
        let mut raw: Vec<(i64, Vec<SqlValue>)> = Vec::with_capacity(source.batch_size);
        {
            let width = self.columns.len();
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(i64, Vec<SqlValue>)> {
                let rowid: i64 = row.get(0)?;
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(row.get::<_, SqlValue>(idx + 1)?);
                }
                Ok((rowid, values))
            };
            let rows = match &self.bound {
                Some(bound) => stmt.query_map(
                    rusqlite::params![self.last_rowid, batch_size, bound],
                    map_row,
                ),
                None => stmt.query_map(rusqlite::params![self.last_rowid, batch_size], map_row),
            }
            .map_err(|e| extraction(table, e.to_string()))?;
            for row in rows {
                raw.push(row.map_err(|e| extraction(table, e.to_string()))?);
            }
        }

        if raw.len() < source.batch_size {
            self.exhausted = true;
        }
        if let Some((rowid, _)) = raw.last() {
            self.last_rowid = *rowid;
        }

        for (_, values) in raw {
            let mut row = Vec::with_capacity(values.len());
            for ((value, ty), column) in values.iter().zip(&self.types).zip(&self.columns) {
                row.push(sqlite_value_to_value(value, ty, &column.name).map_err(|e| {
                    extraction(table, e.to_string())
                })?);
            }
            if let Some((idx, watermark)) = &self.filter {
                let newer = WatermarkValue::from_value(&row[*idx])
                    .and_then(|v| v.compare(watermark))
                    .is_some_and(|o| o == std::cmp::Ordering::Greater);
                if !newer {
                    continue;
                }
            }
            self.buffer.push_back(row);
        }

        tracing::debug!(
            "Read batch from '{}' (last_rowid={}, buffered={})",
            table,
            self.last_rowid,
            self.buffer.len()
        );
        Ok(())
    }
}

impl Iterator for SqliteRowStream<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_batch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            DateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f%:z")
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
        .or_else(|| parse_timestamp(text).map(|naive| naive.and_utc()))
}

/// Julian day number of the Unix epoch, as SQLite's `julianday()` reports it.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Instant of a fractional julian day. SQLite keeps julian days to the
/// millisecond, so the result is rounded to one.
fn julian_day_to_datetime(day: f64) -> Option<DateTime<Utc>> {
    let millis = ((day - UNIX_EPOCH_JULIAN_DAY) * MILLIS_PER_DAY).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

/// Convert a SQLite value to the table-format value of column type `ty`.
///
/// SQLite's dynamic typing means dates and decimals arrive as text and
/// booleans as integers; each is parsed according to the declared type.
/// Timestamps may also be stored as integer Unix seconds or as real julian
/// day numbers.
pub fn sqlite_value_to_value(value: &SqlValue, ty: &PrimitiveType, column: &str) -> Result<Value> {
    let mismatch = || {
        ReplicatorError::InvalidData(format!(
            "column '{}' value {:?} cannot be read as {}",
            column, value, ty
        ))
    };

    let converted = match (ty, value) {
        (_, SqlValue::Null) => Value::Null,
        (PrimitiveType::Boolean, SqlValue::Integer(i)) => Value::Boolean(*i != 0),
        (PrimitiveType::Boolean, SqlValue::Text(t)) => match t.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Value::Boolean(true),
            "false" | "f" | "0" => Value::Boolean(false),
            _ => return Err(mismatch()),
        },
        (PrimitiveType::Int, SqlValue::Integer(i)) => {
            Value::Int(i32::try_from(*i).map_err(|_| mismatch())?)
        }
        (PrimitiveType::Long, SqlValue::Integer(i)) => Value::Long(*i),
        (PrimitiveType::Float, SqlValue::Real(f)) => Value::Float(*f as f32),
        (PrimitiveType::Float, SqlValue::Integer(i)) => Value::Float(*i as f32),
        (PrimitiveType::Double, SqlValue::Real(f)) => Value::Double(*f),
        (PrimitiveType::Double, SqlValue::Integer(i)) => Value::Double(*i as f64),
        (PrimitiveType::Decimal { precision, scale }, v) => {
            let d = match v {
                SqlValue::Integer(i) => Decimal::from(*i),
                SqlValue::Real(f) => Decimal::from_str(&f.to_string()).map_err(|_| mismatch())?,
                SqlValue::Text(t) => Decimal::from_str(t.trim()).map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            };
            Value::Decimal(rescale_decimal(d, *precision, *scale)?)
        }
        (PrimitiveType::Date, SqlValue::Text(t)) => Value::Date(
            NaiveDate::parse_from_str(t.trim().get(..10).unwrap_or(t.as_str()), "%Y-%m-%d")
                .map_err(|_| mismatch())?,
        ),
        (PrimitiveType::Time, SqlValue::Text(t)) => Value::Time(
            NaiveTime::parse_from_str(t.trim(), "%H:%M:%S%.f").map_err(|_| mismatch())?,
        ),
        (PrimitiveType::Timestamp, SqlValue::Text(t)) => {
            Value::Timestamp(parse_timestamp(t).ok_or_else(mismatch)?)
        }
        (PrimitiveType::Timestamp, SqlValue::Integer(secs)) => Value::Timestamp(
            DateTime::from_timestamp(*secs, 0)
                .ok_or_else(mismatch)?
                .naive_utc(),
        ),
        (PrimitiveType::Timestamp, SqlValue::Real(day)) => Value::Timestamp(
            julian_day_to_datetime(*day)
                .ok_or_else(mismatch)?
                .naive_utc(),
        ),
        (PrimitiveType::Timestamptz, SqlValue::Text(t)) => {
            Value::Timestamptz(parse_timestamptz(t).ok_or_else(mismatch)?)
        }
        (PrimitiveType::Timestamptz, SqlValue::Integer(secs)) => {
            Value::Timestamptz(DateTime::from_timestamp(*secs, 0).ok_or_else(mismatch)?)
        }
        (PrimitiveType::Timestamptz, SqlValue::Real(day)) => {
            Value::Timestamptz(julian_day_to_datetime(*day).ok_or_else(mismatch)?)
        }
        (PrimitiveType::String, SqlValue::Text(t)) => Value::String(t.clone()),
        (PrimitiveType::String, SqlValue::Integer(i)) => Value::String(i.to_string()),
        (PrimitiveType::String, SqlValue::Real(f)) => Value::String(f.to_string()),
        (PrimitiveType::Uuid, SqlValue::Text(t)) => {
            Value::Uuid(Uuid::parse_str(t.trim()).map_err(|_| mismatch())?)
        }
        (PrimitiveType::Uuid, SqlValue::Blob(b)) => {
            Value::Uuid(Uuid::from_slice(b).map_err(|_| mismatch())?)
        }
        (PrimitiveType::Fixed(len), SqlValue::Blob(b)) if b.len() == *len as usize => {
            Value::Fixed(b.clone())
        }
        (PrimitiveType::Binary, SqlValue::Blob(b)) => Value::Binary(b.clone()),
        (PrimitiveType::Binary, SqlValue::Text(t)) => Value::Binary(t.as_bytes().to_vec()),
        _ => return Err(mismatch()),
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_rows(n: i64) -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                customer TEXT,
                amount DECIMAL(10,2),
                updated_at DATETIME NOT NULL
            );",
        )
        .unwrap();
        for i in 1..=n {
            conn.execute(
                "INSERT INTO orders (id, customer, amount, updated_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    i,
                    format!("c{}", i),
                    format!("{}.50", i),
                    format!("2024-01-01 00:00:{:02}", i % 60)
                ],
            )
            .unwrap();
        }
        SqliteSource::from_connection(conn, "orders", 7).unwrap()
    }

    #[test]
    fn test_columns_from_table_info() {
        let source = source_with_rows(0);
        let columns = source.columns().unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "customer", "amount", "updated_at"]);
        assert!(!columns[0].nullable);
        assert!(columns[1].nullable);
        assert!(!columns[3].nullable);
        assert_eq!(columns[0].native_type, "BIGINT");
        assert_eq!(columns[2].native_type, "DECIMAL(10,2)");
    }

    #[test]
    fn test_extract_all_pages_through_batches() {
        let source = source_with_rows(20);
        let rows: Vec<Row> = source
            .extract(&ExtractionPredicate::All)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0][0], Value::Long(1));
        assert_eq!(rows[19][0], Value::Long(20));
        assert_eq!(rows[0][2], Value::Decimal(Decimal::new(150, 2)));
    }

    #[test]
    fn test_extract_integer_predicate() {
        let source = source_with_rows(20);
        let predicate = ExtractionPredicate::GreaterThan {
            column: "id".to_string(),
            value: WatermarkValue::Integer(15),
        };
        let ids: Vec<Value> = source
            .extract(&predicate)
            .unwrap()
            .map(|r| r.unwrap()[0].clone())
            .collect();
        assert_eq!(ids, (16..=20).map(Value::Long).collect::<Vec<_>>());
    }

    #[test]
    fn test_extract_timestamp_predicate_is_strict() {
        let source = source_with_rows(20);
        let bound = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 10)
            .unwrap();
        let predicate = ExtractionPredicate::GreaterThan {
            column: "updated_at".to_string(),
            value: WatermarkValue::Timestamp(bound),
        };
        let rows: Vec<Row> = source
            .extract(&predicate)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r[0] != Value::Long(10)));
    }

    #[test]
    fn test_missing_table_is_extraction_error() {
        let conn = Connection::open_in_memory().unwrap();
        let source = SqliteSource::from_connection(conn, "nope", 10).unwrap();
        assert!(matches!(
            source.columns().unwrap_err(),
            ReplicatorError::Extraction { .. }
        ));
    }

    #[test]
    fn test_sqlite_value_conversion() {
        assert_eq!(
            sqlite_value_to_value(&SqlValue::Integer(1), &PrimitiveType::Boolean, "c").unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            sqlite_value_to_value(
                &SqlValue::Text("2024-05-01T10:30:00.250".into()),
                &PrimitiveType::Timestamp,
                "c"
            )
            .unwrap(),
            Value::Timestamp(
                NaiveDate::from_ymd_opt(2024, 5, 1)
                    .unwrap()
                    .and_hms_milli_opt(10, 30, 0, 250)
                    .unwrap()
            )
        );
        assert!(
            sqlite_value_to_value(&SqlValue::Integer(1 << 40), &PrimitiveType::Int, "c").is_err()
        );
        assert_eq!(
            sqlite_value_to_value(&SqlValue::Null, &PrimitiveType::Uuid, "c").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_julian_day_timestamps() {
        let noon = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(
            sqlite_value_to_value(&SqlValue::Real(2_460_311.0), &PrimitiveType::Timestamp, "c")
                .unwrap(),
            Value::Timestamp(noon)
        );
        assert_eq!(
            sqlite_value_to_value(&SqlValue::Real(2_460_311.0), &PrimitiveType::Timestamptz, "c")
                .unwrap(),
            Value::Timestamptz(noon.and_utc())
        );
        assert!(
            sqlite_value_to_value(&SqlValue::Real(f64::NAN), &PrimitiveType::Timestamp, "c")
                .is_err()
        );
    }

    #[test]
    fn test_extract_julian_day_column_with_timestamp_predicate() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, updated_at DATETIME NOT NULL);",
        )
        .unwrap();
        for i in 1..=9 {
            conn.execute(
                "INSERT INTO events (id, updated_at) VALUES (?1, julianday(?2))",
                rusqlite::params![i, format!("2024-01-01 00:00:{:02}.250", i)],
            )
            .unwrap();
        }
        let source = SqliteSource::from_connection(conn, "events", 4).unwrap();

        let bound = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_milli_opt(0, 0, 5, 250)
            .unwrap();
        let predicate = ExtractionPredicate::GreaterThan {
            column: "updated_at".to_string(),
            value: WatermarkValue::Timestamp(bound),
        };
        let rows: Vec<Row> = source
            .extract(&predicate)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let ids: Vec<Value> = rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, (6..=9).map(Value::Long).collect::<Vec<_>>());
        assert_eq!(
            rows[0][1],
            Value::Timestamp(
                NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_milli_opt(0, 0, 6, 250)
                    .unwrap()
            )
        );
    }
}
