//! Streaming batch readers.
//!
//! A reader turns a byte stream into a lazy, finite sequence of
//! [`Batch`]es of raw records, preserving source order and carrying
//! 1-based row numbers for error attribution. Structural validation
//! (header present, configured columns present, at least one data row)
//! happens up front; per-value validation is the Validator's job.
//!
//! Readers are registered by file format in a [`ReaderRegistry`]; new
//! formats are compile-time additions.

pub mod csv_reader;
pub mod decompress;
pub mod excel;
pub mod json;
pub mod parquet_reader;

pub use decompress::maybe_gunzip;

use fileflow_protocol::{FileFormat, LoadErrorKind, SourceConfig};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Read;
use thiserror::Error;

/// Read failures.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("file has no header row")]
    MissingHeader,
    #[error("file is missing configured columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("file contains no data rows")]
    NoDataInFile,
    #[error("file structure is invalid: {0}")]
    Structure(String),
    #[error("parse error at row {row}: {message}")]
    Parse { row: u64, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported encoding '{0}'")]
    Encoding(String),
}

impl ReadError {
    /// Map a read failure onto the load error taxonomy. Structural
    /// faults are stakeholder-facing; byte-level faults (corrupt
    /// stream, truncated gzip) are treated as store read failures.
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            ReadError::MissingHeader | ReadError::Structure(_) | ReadError::Encoding(_) => {
                LoadErrorKind::MissingHeader
            }
            ReadError::MissingColumns(_) => LoadErrorKind::MissingColumns,
            ReadError::NoDataInFile => LoadErrorKind::NoDataInFile,
            ReadError::Parse { .. } | ReadError::Io(_) => LoadErrorKind::StoreUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReadError>;

/// One raw record: field name to raw JSON value, plus its 1-based
/// source row number.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub row: u64,
    pub values: Map<String, Value>,
}

impl Record {
    pub fn get(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&Value::Null)
    }
}

/// A bounded, ordered slice of the file.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Source row number of the first record.
    pub starting_row: u64,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Producer side of the per-file pipeline: batches until end of file.
pub trait RecordReader: Send {
    /// The next batch, or `None` at end of file. Batches are at most
    /// the configured size and preserve source order.
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

impl std::fmt::Debug for dyn RecordReader + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<RecordReader>")
    }
}

/// Constructor signature registered per file format.
pub type ReaderCtor =
    fn(&SourceConfig, Box<dyn Read + Send>, usize) -> Result<Box<dyn RecordReader + Send>>;

/// Keyed constructor lookup: format tag to reader constructor.
pub struct ReaderRegistry {
    ctors: HashMap<FileFormat, ReaderCtor>,
}

impl ReaderRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// The built-in format set.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(FileFormat::Csv, csv_reader::open);
        registry.register(FileFormat::Excel, excel::open);
        registry.register(FileFormat::Json, json::open);
        registry.register(FileFormat::Parquet, parquet_reader::open);
        registry
    }

    pub fn register(&mut self, format: FileFormat, ctor: ReaderCtor) {
        self.ctors.insert(format, ctor);
    }

    /// Open a reader over an already-decompressed byte stream.
    pub fn open(
        &self,
        source: &SourceConfig,
        stream: Box<dyn Read + Send>,
        batch_size: usize,
    ) -> Result<Box<dyn RecordReader + Send>> {
        let ctor = self.ctors.get(&source.format).ok_or_else(|| {
            ReadError::Structure(format!("no reader registered for format '{}'", source.format))
        })?;
        tracing::debug!(source = %source.name, format = %source.format, "opening reader");
        ctor(source, stream, batch_size)
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Check that a header covers every configured field.
pub(crate) fn missing_fields(source: &SourceConfig, header: &[String]) -> Vec<String> {
    source
        .fields
        .iter()
        .filter(|f| !header.iter().any(|h| h == &f.name))
        .map(|f| f.name.clone())
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use fileflow_protocol::{FieldSchema, SemanticType, SourceConfig};

    pub fn source(format: fileflow_protocol::FileFormat) -> SourceConfig {
        SourceConfig {
            name: "customers".into(),
            pattern: "customers_*".into(),
            format,
            gzip: false,
            target_table: "dim_customers".into(),
            csv: Default::default(),
            excel: Default::default(),
            json: Default::default(),
            fields: vec![
                FieldSchema {
                    name: "id".into(),
                    field_type: SemanticType::Integer,
                    nullable: false,
                    rules: vec![],
                },
                FieldSchema {
                    name: "name".into(),
                    field_type: SemanticType::Text,
                    nullable: false,
                    rules: vec![],
                },
                FieldSchema {
                    name: "age".into(),
                    field_type: SemanticType::Integer,
                    nullable: true,
                    rules: vec![],
                },
            ],
            grain: vec!["id".into()],
            row_rules: vec![],
            error_threshold: 0,
            audits: vec![],
            notify: Default::default(),
        }
    }
}
