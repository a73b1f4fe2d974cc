// ABOUTME: SchemaTranslator - maps source column metadata to table-format field descriptors
// ABOUTME: Assigns stable field ids on creation and preserves them by name across evolution

use crate::error::{ReplicatorError, Result};
use crate::iceberg::metadata::TableMetadata;
use crate::iceberg::types::{FieldDescriptor, PrimitiveType, TableSchema, MAX_DECIMAL_SCALE};

/// Column metadata as reported by a row source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    /// Native type name as declared in the source (e.g. `NVARCHAR(50)`, `bigint`).
    pub native_type: String,
    pub nullable: bool,
}

impl SourceColumn {
    pub fn new(name: &str, native_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            native_type: native_type.to_string(),
            nullable,
        }
    }
}

/// Output of a translation: the schema to write with, plus evolution bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaTranslation {
    pub schema: TableSchema,
    /// Highest field id ever assigned for the table (`last-column-id`).
    pub last_column_id: i32,
    /// True when `schema` is a new schema version that must be committed.
    pub changed: bool,
}

/// Translates source columns into a versioned table schema.
pub struct SchemaTranslator;

impl SchemaTranslator {
    /// Translate for either a brand-new table (`existing = None`) or an existing one.
    pub fn translate(
        columns: &[SourceColumn],
        existing: Option<&TableMetadata>,
    ) -> Result<SchemaTranslation> {
        match existing {
            None => Self::translate_new(columns),
            Some(metadata) => {
                let current = metadata.current_schema()?;
                let next_schema_id = metadata
                    .schemas
                    .iter()
                    .map(|s| s.schema_id)
                    .max()
                    .unwrap_or(0)
                    + 1;
                Self::translate_existing(columns, current, metadata.last_column_id, next_schema_id)
            }
        }
    }

    /// Field ids 1..=n in source column order, schema id 0.
    pub fn translate_new(columns: &[SourceColumn]) -> Result<SchemaTranslation> {
        check_unique_names(columns)?;

        let mut fields = Vec::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let field_type = map_native_type(column)?;
            fields.push(FieldDescriptor::new(
                idx as i32 + 1,
                &column.name,
                field_type,
                !column.nullable,
            ));
        }

        let last_column_id = fields.len() as i32;
        Ok(SchemaTranslation {
            schema: TableSchema::new(0, fields),
            last_column_id,
            changed: true,
        })
    }

    /// Reuse ids of columns whose name already exists; new columns get
    /// `last_column_id + 1`, `+ 2`, ... in source order.
    ///
    /// Columns missing from the source are dropped from the new version; their
    /// ids stay retired because `last_column_id` never decreases.
    pub fn translate_existing(
        columns: &[SourceColumn],
        current: &TableSchema,
        last_column_id: i32,
        next_schema_id: i32,
    ) -> Result<SchemaTranslation> {
        check_unique_names(columns)?;

        let mut next_id = last_column_id;
        let mut fields = Vec::with_capacity(columns.len());

        for column in columns {
            let mapped = map_native_type(column)?;
            match current.field_by_name(&column.name) {
                Some(existing) => {
                    if !existing.field_type.can_promote_to(&mapped) {
                        // A narrower source type still fits the wider column.
                        if !mapped.can_promote_to(&existing.field_type) {
                            return Err(ReplicatorError::IncompatibleSchemaChange {
                                column: column.name.clone(),
                                from: existing.field_type.to_string(),
                                to: mapped.to_string(),
                            });
                        }
                    }
                    let field_type = if existing.field_type.can_promote_to(&mapped) {
                        mapped
                    } else {
                        existing.field_type
                    };
                    // Nullability only widens.
                    let required = existing.required && !column.nullable;
                    fields.push(FieldDescriptor {
                        id: existing.id,
                        name: column.name.clone(),
                        required,
                        field_type,
                        doc: existing.doc.clone(),
                    });
                }
                None => {
                    next_id += 1;
                    fields.push(FieldDescriptor::new(
                        next_id,
                        &column.name,
                        mapped,
                        // Rows written before this column existed read as null.
                        false,
                    ));
                }
            }
        }

        let candidate = TableSchema::new(current.schema_id, fields);
        if candidate.same_fields(current) {
            return Ok(SchemaTranslation {
                schema: current.clone(),
                last_column_id,
                changed: false,
            });
        }

        tracing::info!(
            "Schema evolution: schema {} -> {} ({} fields, last column id {} -> {})",
            current.schema_id,
            next_schema_id,
            candidate.fields.len(),
            last_column_id,
            next_id
        );

        Ok(SchemaTranslation {
            schema: TableSchema::new(next_schema_id, candidate.fields),
            last_column_id: next_id,
            changed: true,
        })
    }
}

fn check_unique_names(columns: &[SourceColumn]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for column in columns {
        if !seen.insert(column.name.as_str()) {
            return Err(ReplicatorError::InvalidData(format!(
                "duplicate column name '{}'",
                column.name
            )));
        }
    }
    Ok(())
}

/// Map a native column type to a table-format type.
///
/// Matching is case-insensitive; parameters like `(18,4)` are parsed for
/// fixed-point types and ignored elsewhere.
pub fn map_native_type(column: &SourceColumn) -> Result<PrimitiveType> {
    let unsupported = || ReplicatorError::UnsupportedType {
        column: column.name.clone(),
        native_type: column.native_type.clone(),
    };

    let normalized = column.native_type.trim().to_ascii_lowercase();
    let (base, args) = match normalized.find('(') {
        Some(open) => {
            let close = normalized.rfind(')').ok_or_else(unsupported)?;
            if close < open {
                return Err(unsupported());
            }
            (
                normalized[..open].trim().to_string(),
                Some(normalized[open + 1..close].to_string()),
            )
        }
        None => (normalized.clone(), None),
    };
    let base = base.split_whitespace().collect::<Vec<_>>().join(" ");
    // "int unsigned", "bigint identity" -> leading word carries the type
    let base = strip_modifiers(&base);

    let ty = match base.as_str() {
        "bit" | "bool" | "boolean" => PrimitiveType::Boolean,
        "tinyint" | "smallint" | "int2" | "mediumint" | "int" | "integer" | "int4" => {
            PrimitiveType::Int
        }
        "bigint" | "int8" => PrimitiveType::Long,
        "real" | "float4" => PrimitiveType::Float,
        "float" | "float8" | "double" | "double precision" => PrimitiveType::Double,
        "decimal" | "numeric" | "dec" => {
            let (precision, scale) = parse_precision_scale(args.as_deref()).ok_or_else(unsupported)?;
            PrimitiveType::Decimal { precision, scale }
        }
        "money" => PrimitiveType::Decimal {
            precision: 19,
            scale: 4,
        },
        "smallmoney" => PrimitiveType::Decimal {
            precision: 10,
            scale: 4,
        },
        "date" => PrimitiveType::Date,
        "time" | "time without time zone" => PrimitiveType::Time,
        "datetime" | "datetime2" | "smalldatetime" | "timestamp"
        | "timestamp without time zone" => PrimitiveType::Timestamp,
        "datetimeoffset" | "timestamptz" | "timestamp with time zone" => {
            PrimitiveType::Timestamptz
        }
        "char" | "nchar" | "varchar" | "nvarchar" | "character" | "character varying"
        | "varying character" | "native character" | "text" | "ntext" | "clob" | "string"
        | "xml" | "json" | "jsonb" => PrimitiveType::String,
        "binary" | "varbinary" | "blob" | "bytea" | "image" => PrimitiveType::Binary,
        "uniqueidentifier" | "uuid" | "guid" => PrimitiveType::Uuid,
        _ => return Err(unsupported()),
    };
    Ok(ty)
}

fn strip_modifiers(base: &str) -> String {
    const MODIFIERS: [&str; 3] = [" unsigned", " identity", " auto_increment"];
    let mut out = base.to_string();
    for m in MODIFIERS {
        if let Some(stripped) = out.strip_suffix(m) {
            out = stripped.to_string();
        }
    }
    out
}

/// Default decimal(38,10) when no parameters are declared. Scales above
/// `MAX_DECIMAL_SCALE` cannot be held in memory and are rejected.
fn parse_precision_scale(args: Option<&str>) -> Option<(u8, u8)> {
    let Some(args) = args else {
        return Some((38, 10));
    };
    let mut parts = args.split(',').map(|p| p.trim());
    let precision: u8 = parts.next()?.parse().ok()?;
    let scale: u8 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    if precision == 0 || precision > 38 || scale > precision || scale > MAX_DECIMAL_SCALE {
        return None;
    }
    Some((precision, scale))
}
