//! Shared configuration and types for Fileflow.
//!
//! Everything that crosses a crate boundary lives here: the source
//! registry (what files we accept and where they go), the process
//! configuration read from the environment, load states and the error
//! taxonomy, and the typed value model handed from validation to the
//! database adapters.

pub mod config;
pub mod source;
pub mod types;
pub mod uris;
pub mod value;

pub use config::{AppConfig, ConfigError, Platform, SmtpConfig};
pub use source::{
    AuditCheck, AuditPredicate, CsvOptions, ExcelOptions, FieldRule, FieldSchema, FileFormat,
    JsonOptions, NotifyPolicy, RowRule, SourceConfig, SourceRegistry,
};
pub use types::{Audience, FileLoadId, LoadCounts, LoadErrorKind, LoadState};
pub use uris::{StoreScheme, StoreUri};
pub use value::{FieldValue, SemanticType};
