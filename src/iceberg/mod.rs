// ABOUTME: Table-format engine - schema translation, data files, manifests and catalog commits
// ABOUTME: Produces format-version 2 tables readable by standard table-format tooling

pub mod arrow;
pub mod avro;
pub mod catalog;
pub mod data_file;
pub mod manifest;
pub mod manifest_list;
pub mod metadata;
pub mod schema;
pub mod types;

pub use catalog::{FilesystemCatalog, LoadedTable, PendingCommit, SchemaUpdate, TableCatalog};
pub use data_file::{ColumnarFileWriter, DataFile, DataFileWriterConfig};
pub use metadata::TableMetadata;
pub use schema::{SchemaTranslation, SchemaTranslator, SourceColumn};
pub use types::{FieldDescriptor, PrimitiveType, Row, TableSchema, Value};
