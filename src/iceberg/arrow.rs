// ABOUTME: Conversion between table schemas/rows and Arrow schemas/record batches
// ABOUTME: Attaches PARQUET:field_id metadata so Parquet column descriptors carry field ids

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, FixedSizeBinaryArray,
    Float32Array, Float64Array, Int32Array, Int64Array, StringArray, Time64MicrosecondArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::PARQUET_FIELD_ID_META_KEY;
use uuid::Uuid;

use crate::error::{ReplicatorError, Result};
use crate::iceberg::types::{
    date_from_days, days_from_epoch, decimal_from_unscaled, decimal_unscaled, time_from_micros,
    time_micros, timestamp_from_micros, timestamptz_from_micros, PrimitiveType, Row, TableSchema,
    Value,
};

/// Timezone used for `timestamptz` columns.
pub const UTC_TIMEZONE: &str = "+00:00";

/// Arrow type for a table-format primitive.
pub fn arrow_type(ty: &PrimitiveType) -> DataType {
    match ty {
        PrimitiveType::Boolean => DataType::Boolean,
        PrimitiveType::Int => DataType::Int32,
        PrimitiveType::Long => DataType::Int64,
        PrimitiveType::Float => DataType::Float32,
        PrimitiveType::Double => DataType::Float64,
        PrimitiveType::Decimal { precision, scale } => {
            DataType::Decimal128(*precision, *scale as i8)
        }
        PrimitiveType::Date => DataType::Date32,
        PrimitiveType::Time => DataType::Time64(TimeUnit::Microsecond),
        PrimitiveType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        PrimitiveType::Timestamptz => {
            DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_TIMEZONE.into()))
        }
        PrimitiveType::String => DataType::Utf8,
        PrimitiveType::Uuid => DataType::FixedSizeBinary(16),
        PrimitiveType::Fixed(len) => DataType::FixedSizeBinary(*len as i32),
        PrimitiveType::Binary => DataType::Binary,
    }
}

/// Arrow schema whose fields carry the field id under `PARQUET:field_id`.
pub fn schema_to_arrow(schema: &TableSchema) -> Arc<ArrowSchema> {
    let fields: Vec<Field> = schema
        .fields
        .iter()
        .map(|f| {
            Field::new(&f.name, arrow_type(&f.field_type), !f.required).with_metadata(
                HashMap::from([(PARQUET_FIELD_ID_META_KEY.to_string(), f.id.to_string())]),
            )
        })
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

/// Field id attached to an Arrow field, if any.
pub fn field_id_of(field: &Field) -> Option<i32> {
    field
        .metadata()
        .get(PARQUET_FIELD_ID_META_KEY)
        .and_then(|id| id.parse().ok())
}

/// Build a record batch from rows laid out in `schema` field order.
pub fn rows_to_record_batch(
    schema: &TableSchema,
    arrow_schema: Arc<ArrowSchema>,
    rows: &[Row],
) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields.len());
    for (idx, field) in schema.fields.iter().enumerate() {
        let cells = rows.iter().map(|r| &r[idx]);
        columns.push(build_array(&field.name, &field.field_type, cells, rows.len())?);
    }
    Ok(RecordBatch::try_new(arrow_schema, columns)?)
}

fn mismatch(column: &str, ty: &PrimitiveType, value: &Value) -> ReplicatorError {
    ReplicatorError::InvalidData(format!(
        "column '{}' of type {} cannot hold value {:?}",
        column, ty, value
    ))
}

fn build_array<'a>(
    column: &str,
    ty: &PrimitiveType,
    cells: impl Iterator<Item = &'a Value>,
    len: usize,
) -> Result<ArrayRef> {
    macro_rules! collect {
        ($variant:pat => $out:expr) => {{
            let mut out = Vec::with_capacity(len);
            for cell in cells {
                out.push(match cell {
                    Value::Null => None,
                    $variant => Some($out),
                    other => return Err(mismatch(column, ty, other)),
                });
            }
            out
        }};
    }

    let array: ArrayRef = match ty {
        PrimitiveType::Boolean => Arc::new(BooleanArray::from(collect!(Value::Boolean(b) => *b))),
        PrimitiveType::Int => Arc::new(Int32Array::from(collect!(Value::Int(i) => *i))),
        PrimitiveType::Long => Arc::new(Int64Array::from(collect!(Value::Long(l) => *l))),
        PrimitiveType::Float => Arc::new(Float32Array::from(collect!(Value::Float(f) => *f))),
        PrimitiveType::Double => Arc::new(Float64Array::from(collect!(Value::Double(d) => *d))),
        PrimitiveType::Decimal { precision, scale } => {
            let unscaled = collect!(Value::Decimal(d) => decimal_unscaled(d, *scale as u32)?);
            Arc::new(
                Decimal128Array::from(unscaled)
                    .with_precision_and_scale(*precision, *scale as i8)?,
            )
        }
        PrimitiveType::Date => {
            Arc::new(Date32Array::from(collect!(Value::Date(d) => days_from_epoch(d))))
        }
        PrimitiveType::Time => Arc::new(Time64MicrosecondArray::from(
            collect!(Value::Time(t) => time_micros(t)),
        )),
        PrimitiveType::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            collect!(Value::Timestamp(ts) => ts.and_utc().timestamp_micros()),
        )),
        PrimitiveType::Timestamptz => Arc::new(
            TimestampMicrosecondArray::from(
                collect!(Value::Timestamptz(ts) => ts.timestamp_micros()),
            )
            .with_timezone(UTC_TIMEZONE),
        ),
        PrimitiveType::String => {
            Arc::new(StringArray::from(collect!(Value::String(s) => s.as_str())))
        }
        PrimitiveType::Uuid => {
            let bytes = collect!(Value::Uuid(u) => u.as_bytes().to_vec());
            Arc::new(FixedSizeBinaryArray::try_from_sparse_iter_with_size(
                bytes.into_iter(),
                16,
            )?)
        }
        PrimitiveType::Fixed(width) => {
            let bytes = collect!(Value::Fixed(b) => b.clone());
            Arc::new(FixedSizeBinaryArray::try_from_sparse_iter_with_size(
                bytes.into_iter(),
                *width as i32,
            )?)
        }
        PrimitiveType::Binary => {
            Arc::new(BinaryArray::from(collect!(Value::Binary(b) => b.as_slice())))
        }
    };
    Ok(array)
}

/// Convert a record batch into rows laid out in `schema` field order.
///
/// Columns are matched by field id, so a file written before a column was added
/// yields nulls for it and renamed columns still resolve.
pub fn record_batch_to_rows(schema: &TableSchema, batch: &RecordBatch) -> Result<Vec<Row>> {
    let by_id: HashMap<i32, usize> = batch
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter_map(|(idx, f)| field_id_of(f).map(|id| (id, idx)))
        .collect();

    let num_rows = batch.num_rows();
    let mut rows: Vec<Row> = (0..num_rows)
        .map(|_| Vec::with_capacity(schema.fields.len()))
        .collect();

    for field in &schema.fields {
        match by_id.get(&field.id) {
            Some(&col_idx) => {
                let array = batch.column(col_idx);
                for (row_idx, row) in rows.iter_mut().enumerate() {
                    let value = read_cell(array.as_ref(), row_idx, &field.field_type, &field.name)?;
                    row.push(value);
                }
            }
            None => {
                for row in rows.iter_mut() {
                    row.push(Value::Null);
                }
            }
        }
    }

    Ok(rows)
}

fn downcast<'a, T: 'static>(array: &'a dyn Array, column: &str) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        ReplicatorError::InvalidData(format!(
            "column '{}' has unexpected Arrow type {}",
            column,
            array.data_type()
        ))
    })
}

fn read_cell(array: &dyn Array, idx: usize, ty: &PrimitiveType, column: &str) -> Result<Value> {
    if array.is_null(idx) {
        return Ok(Value::Null);
    }
    let value = match ty {
        PrimitiveType::Boolean => Value::Boolean(downcast::<BooleanArray>(array, column)?.value(idx)),
        // Files written before an int -> long promotion still hold Int32.
        PrimitiveType::Int | PrimitiveType::Long => match array.data_type() {
            DataType::Int32 => {
                let v = downcast::<Int32Array>(array, column)?.value(idx);
                if *ty == PrimitiveType::Long {
                    Value::Long(v as i64)
                } else {
                    Value::Int(v)
                }
            }
            _ => Value::Long(downcast::<Int64Array>(array, column)?.value(idx)),
        },
        PrimitiveType::Float | PrimitiveType::Double => match array.data_type() {
            DataType::Float32 => {
                let v = downcast::<Float32Array>(array, column)?.value(idx);
                if *ty == PrimitiveType::Double {
                    Value::Double(v as f64)
                } else {
                    Value::Float(v)
                }
            }
            _ => Value::Double(downcast::<Float64Array>(array, column)?.value(idx)),
        },
        PrimitiveType::Decimal { scale, .. } => {
            let unscaled = downcast::<Decimal128Array>(array, column)?.value(idx);
            Value::Decimal(decimal_from_unscaled(unscaled, *scale)?)
        }
        PrimitiveType::Date => date_from_days(downcast::<Date32Array>(array, column)?.value(idx))?,
        PrimitiveType::Time => {
            time_from_micros(downcast::<Time64MicrosecondArray>(array, column)?.value(idx))?
        }
        PrimitiveType::Timestamp => {
            timestamp_from_micros(downcast::<TimestampMicrosecondArray>(array, column)?.value(idx))?
        }
        PrimitiveType::Timestamptz => timestamptz_from_micros(
            downcast::<TimestampMicrosecondArray>(array, column)?.value(idx),
        )?,
        PrimitiveType::String => {
            Value::String(downcast::<StringArray>(array, column)?.value(idx).to_string())
        }
        PrimitiveType::Uuid => {
            let bytes = downcast::<FixedSizeBinaryArray>(array, column)?.value(idx);
            Value::Uuid(
                Uuid::from_slice(bytes).map_err(|e| ReplicatorError::InvalidData(e.to_string()))?,
            )
        }
        PrimitiveType::Fixed(_) => {
            Value::Fixed(downcast::<FixedSizeBinaryArray>(array, column)?.value(idx).to_vec())
        }
        PrimitiveType::Binary => {
            Value::Binary(downcast::<BinaryArray>(array, column)?.value(idx).to_vec())
        }
    };
    Ok(value)
}
