//! Source configurations: which files we accept, how to read them, and
//! where their rows go.
//!
//! Sources are declared in a TOML registry file:
//!
//! ```toml
//! [[sources]]
//! name = "customers"
//! pattern = "customers_*.csv"
//! format = "csv"
//! target_table = "dim_customers"
//! grain = ["id"]
//! error_threshold = 0
//!
//! [[sources.fields]]
//! name = "id"
//! field_type = "integer"
//!
//! [[sources.fields]]
//! name = "age"
//! field_type = "integer"
//! nullable = true
//! rules = [{ rule = "min_int", value = 0 }]
//!
//! [[sources.audits]]
//! name = "has_rows"
//! sql = "SELECT COUNT(*) FROM {stage}"
//! predicate = { op = "gt", value = 0 }
//!
//! [sources.notify]
//! recipients = ["ops@example.com"]
//! ```

use crate::types::FileLoadId;
use crate::value::SemanticType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Excel,
    Json,
    Parquet,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Excel => "excel",
            FileFormat::Json => "json",
            FileFormat::Parquet => "parquet",
        }
    }
}

impl FromStr for FileFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "csv" => Ok(FileFormat::Csv),
            "excel" | "xlsx" => Ok(FileFormat::Excel),
            "json" => Ok(FileFormat::Json),
            "parquet" => Ok(FileFormat::Parquet),
            _ => Err(format!("unknown file format '{}'", value)),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CSV read options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub delimiter: char,
    pub encoding: String,
    pub skip_rows: usize,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            encoding: "utf-8".to_string(),
            skip_rows: 0,
        }
    }
}

/// Excel read options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcelOptions {
    /// Sheet name; first sheet when unset.
    pub sheet: Option<String>,
    pub skip_rows: usize,
}

/// JSON read options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonOptions {
    /// Dot-separated path to the record array, e.g. `data.orders`.
    pub record_path: Option<String>,
}

/// Per-field constraint predicates applied after type coercion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    MinInt { value: i64 },
    MaxInt { value: i64 },
    MinFloat { value: f64 },
    MaxFloat { value: f64 },
    MinLen { value: usize },
    MaxLen { value: usize },
    Matches { pattern: String },
    OneOf { values: Vec<String> },
}

/// One declared field of a source schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: SemanticType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub rules: Vec<FieldRule>,
}

/// Cross-field rules evaluated on the typed row after per-field
/// validation succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RowRule {
    /// `left` must not exceed `right` when both are present.
    OrderedPair { left: String, right: String },
    /// At least one of the named fields must be non-null.
    AnyPresent { fields: Vec<String> },
}

/// Comparison applied to an audit's scalar result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuditPredicate {
    pub op: AuditOp,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOp::Eq => "=",
            AuditOp::Ne => "!=",
            AuditOp::Gt => ">",
            AuditOp::Ge => ">=",
            AuditOp::Lt => "<",
            AuditOp::Le => "<=",
        }
    }
}

impl AuditPredicate {
    pub fn holds(&self, observed: f64) -> bool {
        match self.op {
            AuditOp::Eq => observed == self.value,
            AuditOp::Ne => observed != self.value,
            AuditOp::Gt => observed > self.value,
            AuditOp::Ge => observed >= self.value,
            AuditOp::Lt => observed < self.value,
            AuditOp::Le => observed <= self.value,
        }
    }
}

impl fmt::Display for AuditPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.value)
    }
}

/// A user-supplied aggregate check run against the stage table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditCheck {
    pub name: String,
    /// SQL template producing a single scalar; `{stage}` is replaced with
    /// the quoted stage table name.
    pub sql: String,
    pub predicate: AuditPredicate,
}

/// Who to email about this source's files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyPolicy {
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    /// Restrict emails to these failure kinds; empty means all
    /// stakeholder-facing kinds.
    pub only_kinds: Vec<crate::types::LoadErrorKind>,
}

impl NotifyPolicy {
    pub fn wants(&self, kind: crate::types::LoadErrorKind) -> bool {
        if self.recipients.is_empty() {
            return false;
        }
        self.only_kinds.is_empty() || self.only_kinds.contains(&kind)
    }
}

/// One declared source: filename pattern, schema, grain, audits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Glob matched against the base filename (`.gz` stripped first).
    pub pattern: String,
    pub format: FileFormat,
    #[serde(default)]
    pub gzip: bool,
    pub target_table: String,
    #[serde(default)]
    pub csv: CsvOptions,
    #[serde(default)]
    pub excel: ExcelOptions,
    #[serde(default)]
    pub json: JsonOptions,
    pub fields: Vec<FieldSchema>,
    pub grain: Vec<String>,
    #[serde(default)]
    pub row_rules: Vec<RowRule>,
    #[serde(default)]
    pub error_threshold: u64,
    #[serde(default)]
    pub audits: Vec<AuditCheck>,
    #[serde(default)]
    pub notify: NotifyPolicy,
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl SourceConfig {
    /// Check the invariants the rest of the pipeline relies on.
    pub fn validate(&self) -> Result<(), String> {
        if !is_sql_identifier(&self.name) {
            return Err(format!("source name '{}' is not a valid identifier", self.name));
        }
        if !is_sql_identifier(&self.target_table) {
            return Err(format!(
                "source '{}': target table '{}' is not a valid identifier",
                self.name, self.target_table
            ));
        }
        glob::Pattern::new(&self.pattern)
            .map_err(|e| format!("source '{}': invalid pattern: {}", self.name, e))?;

        if self.fields.is_empty() {
            return Err(format!("source '{}' declares no fields", self.name));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_sql_identifier(&field.name) {
                return Err(format!(
                    "source '{}': field '{}' is not a valid identifier",
                    self.name, field.name
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(format!(
                    "source '{}': duplicate field '{}'",
                    self.name, field.name
                ));
            }
            for rule in &field.rules {
                if let FieldRule::Matches { pattern } = rule {
                    regex::Regex::new(pattern).map_err(|e| {
                        format!(
                            "source '{}': field '{}': invalid regex: {}",
                            self.name, field.name, e
                        )
                    })?;
                }
            }
        }

        if self.grain.is_empty() {
            return Err(format!("source '{}' declares an empty grain", self.name));
        }
        for key in &self.grain {
            let Some(field) = self.fields.iter().find(|f| &f.name == key) else {
                return Err(format!(
                    "source '{}': grain field '{}' is not in the schema",
                    self.name, key
                ));
            };
            if field.nullable {
                return Err(format!(
                    "source '{}': grain field '{}' must not be nullable",
                    self.name, key
                ));
            }
        }

        let known = |name: &String| self.fields.iter().any(|f| &f.name == name);
        for rule in &self.row_rules {
            let named: Vec<&String> = match rule {
                RowRule::OrderedPair { left, right } => vec![left, right],
                RowRule::AnyPresent { fields } => fields.iter().collect(),
            };
            for name in named {
                if !known(name) {
                    return Err(format!(
                        "source '{}': row rule references unknown field '{}'",
                        self.name, name
                    ));
                }
            }
        }

        for audit in &self.audits {
            if !audit.sql.contains("{stage}") {
                return Err(format!(
                    "source '{}': audit '{}' does not reference {{stage}}",
                    self.name, audit.name
                ));
            }
        }

        Ok(())
    }

    /// First-match glob test against a base filename. A trailing `.gz`
    /// is stripped before matching so `orders.json.gz` matches
    /// `orders*.json`.
    pub fn matches(&self, filename: &str) -> bool {
        let base = filename.strip_suffix(".gz").unwrap_or(filename);
        glob::Pattern::new(&self.pattern)
            .map(|p| p.matches(base) || p.matches(filename))
            .unwrap_or(false)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Indices of grain fields within the schema field order.
    pub fn grain_indices(&self) -> Vec<usize> {
        self.grain
            .iter()
            .filter_map(|g| self.fields.iter().position(|f| &f.name == g))
            .collect()
    }

    /// Deterministic per-load stage table name.
    pub fn stage_table_name(&self, file_load_id: FileLoadId) -> String {
        format!("stg_{}_{}", self.name, file_load_id)
    }

    /// Whether reads should be gzip-decoded for this path.
    pub fn wants_gzip(&self, path: &Path) -> bool {
        self.gzip
            || path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
    }
}

/// The immutable, validated set of sources for one process run.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        let registry: SourceRegistry =
            toml::from_str(raw).map_err(|e| format!("invalid source registry: {}", e))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read source registry {}: {}", path.display(), e))?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), String> {
        if self.sources.is_empty() {
            return Err("source registry declares no sources".to_string());
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !names.insert(source.name.as_str()) {
                return Err(format!("duplicate source name '{}'", source.name));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// First source whose pattern matches the base filename; declaration
    /// order wins.
    pub fn match_filename(&self, filename: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.matches(filename))
    }

    /// Restrict the registry to a single named source.
    pub fn restrict_to(&self, name: &str) -> Result<Self, String> {
        let source = self
            .get(name)
            .ok_or_else(|| format!("unknown source '{}'", name))?;
        Ok(Self {
            sources: vec![source.clone()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        [[sources]]
        name = "customers"
        pattern = "customers_*.csv"
        format = "csv"
        target_table = "dim_customers"
        grain = ["id"]

        [[sources.fields]]
        name = "id"
        field_type = "integer"

        [[sources.fields]]
        name = "name"
        field_type = "text"

        [[sources.fields]]
        name = "age"
        field_type = "integer"
        nullable = true
        rules = [{ rule = "min_int", value = 0 }]

        [[sources.audits]]
        name = "has_rows"
        sql = "SELECT COUNT(*) FROM {stage}"
        predicate = { op = "gt", value = 0.0 }

        [sources.notify]
        recipients = ["ops@example.com"]
        "#
    }

    #[test]
    fn registry_parses_and_validates() {
        let registry = SourceRegistry::from_toml_str(sample_toml()).unwrap();
        let source = registry.get("customers").unwrap();
        assert_eq!(source.fields.len(), 3);
        assert_eq!(source.grain, vec!["id"]);
        assert_eq!(source.audits.len(), 1);
    }

    #[test]
    fn first_match_wins() {
        let registry = SourceRegistry::from_toml_str(sample_toml()).unwrap();
        assert!(registry.match_filename("customers_2024.csv").is_some());
        assert!(registry.match_filename("customers_2024.csv.gz").is_some());
        assert!(registry.match_filename("orders.csv").is_none());
    }

    #[test]
    fn nullable_grain_is_rejected() {
        let raw = sample_toml().replace("grain = [\"id\"]", "grain = [\"age\"]");
        assert!(SourceRegistry::from_toml_str(&raw).is_err());
    }

    #[test]
    fn grain_must_be_in_schema() {
        let raw = sample_toml().replace("grain = [\"id\"]", "grain = [\"missing\"]");
        assert!(SourceRegistry::from_toml_str(&raw).is_err());
    }

    #[test]
    fn stage_name_is_deterministic() {
        let registry = SourceRegistry::from_toml_str(sample_toml()).unwrap();
        let source = registry.get("customers").unwrap();
        assert_eq!(
            source.stage_table_name(FileLoadId::new(42)),
            "stg_customers_42"
        );
    }

    #[test]
    fn row_rules_must_reference_schema_fields() {
        let raw = sample_toml().replace(
            "grain = [\"id\"]",
            "grain = [\"id\"]\n        row_rules = [{ rule = \"any_present\", fields = [\"nope\"] }]",
        );
        assert!(SourceRegistry::from_toml_str(&raw).is_err());

        let raw = sample_toml().replace(
            "grain = [\"id\"]",
            "grain = [\"id\"]\n        row_rules = [{ rule = \"ordered_pair\", left = \"id\", right = \"age\" }]",
        );
        assert!(SourceRegistry::from_toml_str(&raw).is_ok());
    }

    #[test]
    fn audit_predicate_comparisons() {
        let predicate = AuditPredicate {
            op: AuditOp::Ge,
            value: 1.0,
        };
        assert!(predicate.holds(1.0));
        assert!(!predicate.holds(0.0));
    }
}
