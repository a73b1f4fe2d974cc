// ABOUTME: Avro object-container writing with a verbatim schema header, plus value helpers
// ABOUTME: Datum bodies are encoded by apache-avro; the header keeps field-id attributes intact

use std::collections::{BTreeMap, HashMap};

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use rand::RngCore;

use crate::error::{ReplicatorError, Result};

const MAGIC: &[u8; 4] = b"Obj\x01";
const SCHEMA_KEY: &str = "avro.schema";
const CODEC_KEY: &str = "avro.codec";

/// Encode an object container file holding `records`.
///
/// `schema_text` is written to the header byte-for-byte, so custom attributes
/// such as `field-id` survive. `metadata` entries are added after `avro.schema`
/// and `avro.codec`.
pub fn write_container(
    schema_text: &str,
    metadata: &[(&str, String)],
    records: Vec<AvroValue>,
) -> Result<Vec<u8>> {
    let schema = AvroSchema::parse_str(schema_text)?;

    let mut sync = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut sync);

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);

    let mut entries: Vec<(&str, &[u8])> = vec![
        (SCHEMA_KEY, schema_text.as_bytes()),
        (CODEC_KEY, b"null".as_slice()),
    ];
    for (key, value) in metadata {
        entries.push((*key, value.as_bytes()));
    }
    encode_long(entries.len() as i64, &mut out);
    for (key, value) in entries {
        encode_bytes(key.as_bytes(), &mut out);
        encode_bytes(value, &mut out);
    }
    encode_long(0, &mut out);
    out.extend_from_slice(&sync);

    if !records.is_empty() {
        let count = records.len();
        let mut block = Vec::new();
        for record in records {
            block.extend(apache_avro::to_avro_datum(&schema, record)?);
        }
        encode_long(count as i64, &mut out);
        encode_long(block.len() as i64, &mut out);
        out.extend(block);
        out.extend_from_slice(&sync);
    }

    Ok(out)
}

/// Parse every record of an object container file.
///
/// Returns the records and the user metadata (keys that are not `avro.*`).
pub fn read_container(bytes: &[u8]) -> Result<(Vec<AvroValue>, HashMap<String, Vec<u8>>)> {
    let reader = apache_avro::Reader::new(bytes)?;
    let metadata = reader.user_metadata().clone();
    let mut records = Vec::new();
    for record in reader {
        records.push(record?);
    }
    Ok((records, metadata))
}

/// Decode the header metadata map exactly as stored, including `avro.schema`.
pub fn read_header(bytes: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(ReplicatorError::InvalidData(
            "not an Avro object container file".to_string(),
        ));
    }
    let mut pos = MAGIC.len();
    let mut metadata = HashMap::new();
    loop {
        let mut count = decode_long(bytes, &mut pos)?;
        if count == 0 {
            break;
        }
        if count < 0 {
            // Negative counts are followed by the block byte size.
            count = -count;
            decode_long(bytes, &mut pos)?;
        }
        for _ in 0..count {
            let key = String::from_utf8(decode_bytes(bytes, &mut pos)?.to_vec())
                .map_err(|e| ReplicatorError::InvalidData(e.to_string()))?;
            let value = decode_bytes(bytes, &mut pos)?.to_vec();
            metadata.insert(key, value);
        }
    }
    Ok(metadata)
}

/// The schema text stored in a container header.
pub fn header_schema_text(bytes: &[u8]) -> Result<String> {
    let header = read_header(bytes)?;
    let schema = header
        .get(SCHEMA_KEY)
        .ok_or_else(|| ReplicatorError::InvalidData("missing avro.schema".to_string()))?;
    String::from_utf8(schema.clone()).map_err(|e| ReplicatorError::InvalidData(e.to_string()))
}

fn encode_long(value: i64, out: &mut Vec<u8>) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        if zigzag & !0x7f == 0 {
            out.push(zigzag as u8);
            return;
        }
        out.push(((zigzag & 0x7f) | 0x80) as u8);
        zigzag >>= 7;
    }
}

fn encode_bytes(value: &[u8], out: &mut Vec<u8>) {
    encode_long(value.len() as i64, out);
    out.extend_from_slice(value);
}

fn decode_long(bytes: &[u8], pos: &mut usize) -> Result<i64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *bytes.get(*pos).ok_or_else(|| {
            ReplicatorError::InvalidData("truncated Avro header".to_string())
        })?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(ReplicatorError::InvalidData(
                "Avro varint overflow".to_string(),
            ));
        }
    }
    Ok(((result >> 1) as i64) ^ -((result & 1) as i64))
}

fn decode_bytes<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = decode_long(bytes, pos)?;
    let len = usize::try_from(len)
        .map_err(|_| ReplicatorError::InvalidData("negative Avro length".to_string()))?;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| ReplicatorError::InvalidData("truncated Avro header".to_string()))?;
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

// ---- value construction ----

pub(crate) fn record(fields: Vec<(&str, AvroValue)>) -> AvroValue {
    AvroValue::Record(
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    )
}

/// `["null", T]` union value.
pub(crate) fn optional(value: Option<AvroValue>) -> AvroValue {
    match value {
        None => AvroValue::Union(0, Box::new(AvroValue::Null)),
        Some(v) => AvroValue::Union(1, Box::new(v)),
    }
}

/// Map encoded as an array of `{key, value}` records.
pub(crate) fn int_long_map(map: &BTreeMap<i32, i64>) -> AvroValue {
    AvroValue::Array(
        map.iter()
            .map(|(k, v)| record(vec![("key", AvroValue::Int(*k)), ("value", AvroValue::Long(*v))]))
            .collect(),
    )
}

pub(crate) fn int_bytes_map(map: &BTreeMap<i32, Vec<u8>>) -> AvroValue {
    AvroValue::Array(
        map.iter()
            .map(|(k, v)| {
                record(vec![
                    ("key", AvroValue::Int(*k)),
                    ("value", AvroValue::Bytes(v.clone())),
                ])
            })
            .collect(),
    )
}

// ---- value access ----

fn invalid(message: String) -> ReplicatorError {
    ReplicatorError::InvalidData(message)
}

pub(crate) fn get<'a>(value: &'a AvroValue, name: &str) -> Result<&'a AvroValue> {
    match value {
        AvroValue::Record(fields) => fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| invalid(format!("Avro record has no field '{}'", name))),
        other => Err(invalid(format!("expected Avro record, found {:?}", other))),
    }
}

/// Strip a union wrapper; `None` for the null branch.
pub(crate) fn non_null(value: &AvroValue) -> Option<&AvroValue> {
    match value {
        AvroValue::Union(_, inner) => non_null(inner),
        AvroValue::Null => None,
        other => Some(other),
    }
}

pub(crate) fn as_int(value: &AvroValue) -> Result<i32> {
    match non_null(value) {
        Some(AvroValue::Int(i)) => Ok(*i),
        other => Err(invalid(format!("expected Avro int, found {:?}", other))),
    }
}

pub(crate) fn as_long(value: &AvroValue) -> Result<i64> {
    match non_null(value) {
        Some(AvroValue::Long(l)) => Ok(*l),
        Some(AvroValue::Int(i)) => Ok(*i as i64),
        other => Err(invalid(format!("expected Avro long, found {:?}", other))),
    }
}

pub(crate) fn as_opt_long(value: &AvroValue) -> Result<Option<i64>> {
    non_null(value).map(as_long).transpose()
}

pub(crate) fn as_bool(value: &AvroValue) -> Result<bool> {
    match non_null(value) {
        Some(AvroValue::Boolean(b)) => Ok(*b),
        other => Err(invalid(format!("expected Avro boolean, found {:?}", other))),
    }
}

pub(crate) fn as_string(value: &AvroValue) -> Result<String> {
    match non_null(value) {
        Some(AvroValue::String(s)) => Ok(s.clone()),
        other => Err(invalid(format!("expected Avro string, found {:?}", other))),
    }
}

pub(crate) fn as_opt_bytes(value: &AvroValue) -> Result<Option<Vec<u8>>> {
    match non_null(value) {
        None => Ok(None),
        Some(AvroValue::Bytes(b)) | Some(AvroValue::Fixed(_, b)) => Ok(Some(b.clone())),
        other => Err(invalid(format!("expected Avro bytes, found {:?}", other))),
    }
}

pub(crate) fn as_array(value: &AvroValue) -> Result<&[AvroValue]> {
    match non_null(value) {
        None => Ok(&[]),
        Some(AvroValue::Array(items)) => Ok(items),
        other => Err(invalid(format!("expected Avro array, found {:?}", other))),
    }
}

pub(crate) fn read_int_long_map(value: &AvroValue) -> Result<BTreeMap<i32, i64>> {
    let mut map = BTreeMap::new();
    for item in as_array(value)? {
        map.insert(as_int(get(item, "key")?)?, as_long(get(item, "value")?)?);
    }
    Ok(map)
}

pub(crate) fn read_int_bytes_map(value: &AvroValue) -> Result<BTreeMap<i32, Vec<u8>>> {
    let mut map = BTreeMap::new();
    for item in as_array(value)? {
        if let Some(bytes) = as_opt_bytes(get(item, "value")?)? {
            map.insert(as_int(get(item, "key")?)?, bytes);
        }
    }
    Ok(map)
}

/// Look up a UTF-8 user metadata value.
pub(crate) fn metadata_str(metadata: &HashMap<String, Vec<u8>>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| String::from_utf8(v.clone()).ok())
}
