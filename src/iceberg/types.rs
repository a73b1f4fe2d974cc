// ABOUTME: Primitive types, field descriptors, schemas and row values for the table format
// ABOUTME: Values are a tagged union matching the type table, with single-value bound encoding

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ReplicatorError, Result};

/// Primitive types supported by the table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Date,
    /// Time of day, microsecond precision.
    Time,
    /// Timestamp without zone, microsecond precision.
    Timestamp,
    /// Timestamp with zone, stored as UTC, microsecond precision.
    Timestamptz,
    String,
    Uuid,
    Fixed(u32),
    Binary,
}

impl PrimitiveType {
    /// Whether a column of type `self` may be read as `to` after evolution.
    pub fn can_promote_to(&self, to: &PrimitiveType) -> bool {
        match (self, to) {
            (a, b) if a == b => true,
            (PrimitiveType::Int, PrimitiveType::Long) => true,
            (PrimitiveType::Float, PrimitiveType::Double) => true,
            (
                PrimitiveType::Decimal { precision: p1, scale: s1 },
                PrimitiveType::Decimal { precision: p2, scale: s2 },
            ) => s1 == s2 && p2 >= p1,
            _ => false,
        }
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, PrimitiveType::Float | PrimitiveType::Double)
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveType::Boolean => write!(f, "boolean"),
            PrimitiveType::Int => write!(f, "int"),
            PrimitiveType::Long => write!(f, "long"),
            PrimitiveType::Float => write!(f, "float"),
            PrimitiveType::Double => write!(f, "double"),
            PrimitiveType::Decimal { precision, scale } => {
                write!(f, "decimal({},{})", precision, scale)
            }
            PrimitiveType::Date => write!(f, "date"),
            PrimitiveType::Time => write!(f, "time"),
            PrimitiveType::Timestamp => write!(f, "timestamp"),
            PrimitiveType::Timestamptz => write!(f, "timestamptz"),
            PrimitiveType::String => write!(f, "string"),
            PrimitiveType::Uuid => write!(f, "uuid"),
            PrimitiveType::Fixed(len) => write!(f, "fixed[{}]", len),
            PrimitiveType::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for PrimitiveType {
    type Err = ReplicatorError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parsed = match s {
            "boolean" => PrimitiveType::Boolean,
            "int" => PrimitiveType::Int,
            "long" => PrimitiveType::Long,
            "float" => PrimitiveType::Float,
            "double" => PrimitiveType::Double,
            "date" => PrimitiveType::Date,
            "time" => PrimitiveType::Time,
            "timestamp" => PrimitiveType::Timestamp,
            "timestamptz" => PrimitiveType::Timestamptz,
            "string" => PrimitiveType::String,
            "uuid" => PrimitiveType::Uuid,
            "binary" => PrimitiveType::Binary,
            _ => {
                if let Some(args) = s
                    .strip_prefix("decimal(")
                    .and_then(|rest| rest.strip_suffix(')'))
                {
                    let (p, sc) = args.split_once(',').ok_or_else(|| {
                        ReplicatorError::InvalidData(format!("malformed decimal type '{}'", s))
                    })?;
                    PrimitiveType::Decimal {
                        precision: parse_type_arg(p, s)?,
                        scale: parse_type_arg(sc, s)?,
                    }
                } else if let Some(len) = s
                    .strip_prefix("fixed[")
                    .and_then(|rest| rest.strip_suffix(']'))
                {
                    PrimitiveType::Fixed(len.trim().parse().map_err(|_| {
                        ReplicatorError::InvalidData(format!("malformed fixed type '{}'", s))
                    })?)
                } else {
                    return Err(ReplicatorError::InvalidData(format!(
                        "unknown table type '{}'",
                        s
                    )));
                }
            }
        };
        Ok(parsed)
    }
}

fn parse_type_arg(arg: &str, whole: &str) -> Result<u8> {
    arg.trim()
        .parse()
        .map_err(|_| ReplicatorError::InvalidData(format!("malformed type '{}'", whole)))
}

impl Serialize for PrimitiveType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PrimitiveType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One column of the logical schema.
///
/// The `id` is assigned once and never reused, even if the column is renamed
/// or dropped later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub id: i32,
    pub name: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub field_type: PrimitiveType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub doc: Option<String>,
}

impl FieldDescriptor {
    pub fn new(id: i32, name: &str, field_type: PrimitiveType, required: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            required,
            field_type,
            doc: None,
        }
    }
}

/// Ordered set of fields, versioned by `schema_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(rename = "type", default = "default_struct_type")]
    pub schema_type: String,
    #[serde(rename = "schema-id")]
    pub schema_id: i32,
    pub fields: Vec<FieldDescriptor>,
}

fn default_struct_type() -> String {
    "struct".to_string()
}

impl TableSchema {
    pub fn new(schema_id: i32, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            schema_type: default_struct_type(),
            schema_id,
            fields,
        }
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_id(&self, id: i32) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn highest_field_id(&self) -> i32 {
        self.fields.iter().map(|f| f.id).max().unwrap_or(0)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Same fields (ids, names, types, nullability) regardless of schema id.
    pub fn same_fields(&self, other: &TableSchema) -> bool {
        self.fields == other.fields
    }
}

/// One scalar cell. Variants mirror [`PrimitiveType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<Utc>),
    String(String),
    Uuid(Uuid),
    Fixed(Vec<u8>),
    Binary(Vec<u8>),
}

/// A row is a vector of values in schema field order.
pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_nan(&self) -> bool {
        match self {
            Value::Float(f) => f.is_nan(),
            Value::Double(d) => d.is_nan(),
            _ => false,
        }
    }

    /// Whether this value can be stored in a column of type `ty`.
    pub fn conforms_to(&self, ty: &PrimitiveType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Boolean(_), PrimitiveType::Boolean) => true,
            (Value::Int(_), PrimitiveType::Int) => true,
            (Value::Long(_), PrimitiveType::Long) => true,
            (Value::Float(_), PrimitiveType::Float) => true,
            (Value::Double(_), PrimitiveType::Double) => true,
            (Value::Decimal(_), PrimitiveType::Decimal { .. }) => true,
            (Value::Date(_), PrimitiveType::Date) => true,
            (Value::Time(_), PrimitiveType::Time) => true,
            (Value::Timestamp(_), PrimitiveType::Timestamp) => true,
            (Value::Timestamptz(_), PrimitiveType::Timestamptz) => true,
            (Value::String(_), PrimitiveType::String) => true,
            (Value::Uuid(_), PrimitiveType::Uuid) => true,
            (Value::Fixed(b), PrimitiveType::Fixed(len)) => b.len() == *len as usize,
            (Value::Binary(_), PrimitiveType::Binary) => true,
            _ => false,
        }
    }

    /// Convert to the column type after a legal promotion (int→long, float→double,
    /// decimal rescale). Values that already conform are returned unchanged.
    pub fn coerce_to(self, ty: &PrimitiveType) -> Result<Value> {
        let coerced = match (self, ty) {
            (Value::Decimal(d), PrimitiveType::Decimal { precision, scale }) => {
                Value::Decimal(rescale_decimal(d, *precision, *scale)?)
            }
            (v, ty) if v.conforms_to(ty) => v,
            (Value::Int(i), PrimitiveType::Long) => Value::Long(i as i64),
            (Value::Float(f), PrimitiveType::Double) => Value::Double(f as f64),
            (v, ty) => {
                return Err(ReplicatorError::InvalidData(format!(
                    "value {} does not fit column type {}",
                    v, ty
                )))
            }
        };
        Ok(coerced)
    }

    /// Compare two non-null values of the same kind. NaN and mixed kinds compare as `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Timestamptz(a), Value::Timestamptz(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Fixed(a), Value::Fixed(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Encode as the format's single-value binary serialization (used for bounds).
    ///
    /// Returns `None` for null. Decimals use the column's scale.
    pub fn to_bound_bytes(&self, ty: &PrimitiveType) -> Option<Vec<u8>> {
        let bytes = match self {
            Value::Null => return None,
            Value::Boolean(b) => vec![u8::from(*b)],
            Value::Int(i) => i.to_le_bytes().to_vec(),
            Value::Long(l) => l.to_le_bytes().to_vec(),
            Value::Float(f) => f.to_le_bytes().to_vec(),
            Value::Double(d) => d.to_le_bytes().to_vec(),
            Value::Decimal(d) => {
                let scale = match ty {
                    PrimitiveType::Decimal { scale, .. } => *scale as u32,
                    _ => d.scale(),
                };
                minimal_twos_complement(decimal_unscaled(d, scale).ok()?)
            }
            Value::Date(d) => days_from_epoch(d).to_le_bytes().to_vec(),
            Value::Time(t) => time_micros(t).to_le_bytes().to_vec(),
            Value::Timestamp(ts) => ts.and_utc().timestamp_micros().to_le_bytes().to_vec(),
            Value::Timestamptz(ts) => ts.timestamp_micros().to_le_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Uuid(u) => u.as_bytes().to_vec(),
            Value::Fixed(b) | Value::Binary(b) => b.clone(),
        };
        Some(bytes)
    }

    /// Decode a single-value binary serialization produced by [`Value::to_bound_bytes`].
    pub fn from_bound_bytes(ty: &PrimitiveType, bytes: &[u8]) -> Result<Value> {
        fn fixed<const N: usize>(bytes: &[u8], ty: &PrimitiveType) -> Result<[u8; N]> {
            bytes.try_into().map_err(|_| {
                ReplicatorError::InvalidData(format!(
                    "bound for {} has {} bytes, expected {}",
                    ty,
                    bytes.len(),
                    N
                ))
            })
        }

        let value = match ty {
            PrimitiveType::Boolean => Value::Boolean(fixed::<1>(bytes, ty)?[0] != 0),
            PrimitiveType::Int => Value::Int(i32::from_le_bytes(fixed(bytes, ty)?)),
            PrimitiveType::Long => Value::Long(i64::from_le_bytes(fixed(bytes, ty)?)),
            PrimitiveType::Float => Value::Float(f32::from_le_bytes(fixed(bytes, ty)?)),
            PrimitiveType::Double => Value::Double(f64::from_le_bytes(fixed(bytes, ty)?)),
            PrimitiveType::Decimal { scale, .. } => {
                let unscaled = from_twos_complement(bytes)?;
                Value::Decimal(decimal_from_unscaled(unscaled, *scale)?)
            }
            PrimitiveType::Date => date_from_days(i32::from_le_bytes(fixed(bytes, ty)?))?,
            PrimitiveType::Time => time_from_micros(i64::from_le_bytes(fixed(bytes, ty)?))?,
            PrimitiveType::Timestamp => {
                timestamp_from_micros(i64::from_le_bytes(fixed(bytes, ty)?))?
            }
            PrimitiveType::Timestamptz => {
                timestamptz_from_micros(i64::from_le_bytes(fixed(bytes, ty)?))?
            }
            PrimitiveType::String => Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| ReplicatorError::InvalidData(e.to_string()))?,
            ),
            PrimitiveType::Uuid => Value::Uuid(Uuid::from_bytes(fixed(bytes, ty)?)),
            PrimitiveType::Fixed(_) => Value::Fixed(bytes.to_vec()),
            PrimitiveType::Binary => Value::Binary(bytes.to_vec()),
        };
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}", l),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::Timestamptz(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::String(s) => write!(f, "{}", s),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Fixed(b) | Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

pub(crate) fn days_from_epoch(date: &NaiveDate) -> i32 {
    date.signed_duration_since(epoch()).num_days() as i32
}

pub(crate) fn date_from_days(days: i32) -> Result<Value> {
    epoch()
        .checked_add_signed(chrono::Duration::days(days as i64))
        .map(Value::Date)
        .ok_or_else(|| ReplicatorError::InvalidData(format!("date out of range: {} days", days)))
}

pub(crate) fn time_micros(time: &NaiveTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * 1_000_000 + (time.nanosecond() / 1_000) as i64
}

pub(crate) fn time_from_micros(micros: i64) -> Result<Value> {
    let secs = micros.div_euclid(1_000_000) as u32;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .map(Value::Time)
        .ok_or_else(|| ReplicatorError::InvalidData(format!("time out of range: {}us", micros)))
}

pub(crate) fn timestamp_from_micros(micros: i64) -> Result<Value> {
    DateTime::from_timestamp_micros(micros)
        .map(|dt| Value::Timestamp(dt.naive_utc()))
        .ok_or_else(|| {
            ReplicatorError::InvalidData(format!("timestamp out of range: {}us", micros))
        })
}

pub(crate) fn timestamptz_from_micros(micros: i64) -> Result<Value> {
    DateTime::from_timestamp_micros(micros)
        .map(Value::Timestamptz)
        .ok_or_else(|| {
            ReplicatorError::InvalidData(format!("timestamp out of range: {}us", micros))
        })
}

/// Largest scale `rust_decimal` can represent.
pub const MAX_DECIMAL_SCALE: u8 = 28;

/// `d` at exactly `scale`, with at most `precision` significant digits.
///
/// `Decimal::rescale` silently settles for a smaller scale when the value
/// cannot carry the requested one, so the result scale is checked.
pub fn rescale_decimal(d: Decimal, precision: u8, scale: u8) -> Result<Decimal> {
    let mut scaled = d;
    scaled.rescale(scale as u32);
    let too_wide = scaled.mantissa().unsigned_abs() >= 10u128.pow(precision as u32);
    if scaled.scale() != scale as u32 || too_wide {
        return Err(ReplicatorError::InvalidData(format!(
            "decimal {} does not fit decimal({}, {})",
            d, precision, scale
        )));
    }
    Ok(scaled)
}

/// Unscaled integer representation of `d` at `scale`.
pub(crate) fn decimal_unscaled(d: &Decimal, scale: u32) -> Result<i128> {
    let mut scaled = *d;
    scaled.rescale(scale);
    if scaled.scale() != scale {
        return Err(ReplicatorError::InvalidData(format!(
            "decimal {} cannot be represented at scale {}",
            d, scale
        )));
    }
    Ok(scaled.mantissa())
}

pub(crate) fn decimal_from_unscaled(unscaled: i128, scale: u8) -> Result<Decimal> {
    Decimal::try_from_i128_with_scale(unscaled, scale as u32)
        .map_err(|e| ReplicatorError::InvalidData(format!("decimal out of range: {}", e)))
}

/// Big-endian two's complement using the fewest bytes that preserve the sign.
fn minimal_twos_complement(value: i128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn from_twos_complement(bytes: &[u8]) -> Result<i128> {
    if bytes.is_empty() || bytes.len() > 16 {
        return Err(ReplicatorError::InvalidData(format!(
            "decimal bound has {} bytes",
            bytes.len()
        )));
    }
    let fill = if bytes[0] & 0x80 != 0 { 0xff } else { 0x00 };
    let mut buf = [fill; 16];
    buf[16 - bytes.len()..].copy_from_slice(bytes);
    Ok(i128::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_type_round_trips_through_strings() {
        for ty in [
            PrimitiveType::Boolean,
            PrimitiveType::Long,
            PrimitiveType::Decimal {
                precision: 19,
                scale: 4,
            },
            PrimitiveType::Timestamptz,
            PrimitiveType::Fixed(16),
        ] {
            let text = ty.to_string();
            assert_eq!(text.parse::<PrimitiveType>().unwrap(), ty);
        }
        assert_eq!(
            "decimal(10, 2)".parse::<PrimitiveType>().unwrap(),
            PrimitiveType::Decimal {
                precision: 10,
                scale: 2
            }
        );
        assert!("varchar".parse::<PrimitiveType>().is_err());
    }

    #[test]
    fn test_field_serializes_in_table_format_shape() {
        let field = FieldDescriptor::new(3, "amount", PrimitiveType::Double, false);
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 3, "name": "amount", "required": false, "type": "double"})
        );

        let schema = TableSchema::new(0, vec![field]);
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["type"], "struct");
        assert_eq!(json["schema-id"], 0);
    }

    #[test]
    fn test_promotion_rules() {
        assert!(PrimitiveType::Int.can_promote_to(&PrimitiveType::Long));
        assert!(PrimitiveType::Float.can_promote_to(&PrimitiveType::Double));
        assert!(!PrimitiveType::Long.can_promote_to(&PrimitiveType::Int));
        assert!(!PrimitiveType::String.can_promote_to(&PrimitiveType::Binary));
        let narrow = PrimitiveType::Decimal {
            precision: 10,
            scale: 2,
        };
        let wide = PrimitiveType::Decimal {
            precision: 18,
            scale: 2,
        };
        assert!(narrow.can_promote_to(&wide));
        assert!(!wide.can_promote_to(&narrow));
    }

    #[test]
    fn test_bound_bytes_follow_single_value_serialization() {
        assert_eq!(
            Value::Int(1).to_bound_bytes(&PrimitiveType::Int),
            Some(vec![1, 0, 0, 0])
        );
        assert_eq!(
            Value::Boolean(true).to_bound_bytes(&PrimitiveType::Boolean),
            Some(vec![1])
        );
        assert_eq!(Value::Null.to_bound_bytes(&PrimitiveType::Int), None);

        let date = NaiveDate::from_ymd_opt(1970, 1, 2).unwrap();
        assert_eq!(
            Value::Date(date).to_bound_bytes(&PrimitiveType::Date),
            Some(vec![1, 0, 0, 0])
        );

        // decimal(5,2) 1.00 -> unscaled 100 -> 0x64
        let ty = PrimitiveType::Decimal {
            precision: 5,
            scale: 2,
        };
        let one = Decimal::new(1, 0);
        assert_eq!(Value::Decimal(one).to_bound_bytes(&ty), Some(vec![0x64]));

        // -1 encodes as a single 0xff byte
        let minus = Decimal::new(-1, 2);
        assert_eq!(Value::Decimal(minus).to_bound_bytes(&ty), Some(vec![0xff]));
    }

    #[test]
    fn test_bound_bytes_decode() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_micro_opt(8, 30, 15, 250)
            .unwrap();
        let bytes = Value::Timestamp(ts)
            .to_bound_bytes(&PrimitiveType::Timestamp)
            .unwrap();
        assert_eq!(
            Value::from_bound_bytes(&PrimitiveType::Timestamp, &bytes).unwrap(),
            Value::Timestamp(ts)
        );

        let ty = PrimitiveType::Decimal {
            precision: 12,
            scale: 3,
        };
        let d = Decimal::new(-123456, 3);
        let bytes = Value::Decimal(d).to_bound_bytes(&ty).unwrap();
        assert_eq!(
            Value::from_bound_bytes(&ty, &bytes).unwrap(),
            Value::Decimal(d)
        );
    }

    #[test]
    fn test_compare_same_kind_only() {
        assert_eq!(
            Value::Long(1).compare(&Value::Long(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Long(1).compare(&Value::Int(2)), None);
        assert_eq!(Value::Double(f64::NAN).compare(&Value::Double(1.0)), None);
    }

    #[test]
    fn test_coerce_to_promoted_types() {
        assert_eq!(
            Value::Int(7).coerce_to(&PrimitiveType::Long).unwrap(),
            Value::Long(7)
        );
        assert_eq!(
            Value::Float(1.5).coerce_to(&PrimitiveType::Double).unwrap(),
            Value::Double(1.5)
        );
        assert_eq!(
            Value::Null.coerce_to(&PrimitiveType::Long).unwrap(),
            Value::Null
        );
        let ty = PrimitiveType::Decimal {
            precision: 10,
            scale: 2,
        };
        match Value::Decimal(Decimal::new(15, 1)).coerce_to(&ty).unwrap() {
            Value::Decimal(d) => assert_eq!(d.scale(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(Value::String("x".into())
            .coerce_to(&PrimitiveType::Int)
            .is_err());
    }

    #[test]
    fn test_rescale_decimal_at_scale_limit() {
        let d = rescale_decimal(Decimal::new(15, 1), 38, MAX_DECIMAL_SCALE).unwrap();
        assert_eq!(d.scale(), 28);
        assert_eq!(d, Decimal::new(15, 1));
        assert_eq!(decimal_unscaled(&d, 28).unwrap(), 15 * 10i128.pow(27));

        // 21 integer digits cannot also carry 10 fractional digits in 96 bits
        let wide = Decimal::from_str("123456789012345678901").unwrap();
        assert!(rescale_decimal(wide, 38, 10).is_err());
        assert!(decimal_unscaled(&wide, 10).is_err());
        assert!(Value::Decimal(wide)
            .coerce_to(&PrimitiveType::Decimal {
                precision: 38,
                scale: 10
            })
            .is_err());
    }

    #[test]
    fn test_rescale_decimal_enforces_precision() {
        assert!(rescale_decimal(Decimal::new(99999, 2), 5, 2).is_ok());
        assert!(rescale_decimal(Decimal::new(1234567, 2), 5, 2).is_err());
        assert!(rescale_decimal(Decimal::new(-1000, 0), 5, 2).is_err());
    }

    #[test]
    fn test_conforms_to() {
        assert!(Value::Null.conforms_to(&PrimitiveType::Uuid));
        assert!(Value::Fixed(vec![0; 4]).conforms_to(&PrimitiveType::Fixed(4)));
        assert!(!Value::Fixed(vec![0; 3]).conforms_to(&PrimitiveType::Fixed(4)));
        assert!(!Value::Int(1).conforms_to(&PrimitiveType::Long));
    }
}
