//! Warehouse table schema
//!
//! A schema resource is a JSON file named `schema_<name>.json` holding a
//! single key `<name>` whose value is the ordered list of fields. The schema
//! is loaded once per run and shared read-only by every load job.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{Result, TracklogError};

/// Name of the schema used for daily tracking logs
pub const TRACKING_LOG_SCHEMA: &str = "tracking_log";

const BUILTIN_TRACKING_LOG: &str = include_str!("../schemas/schema_tracking_log.json");

const KNOWN_TYPES: &[&str] = &[
    "STRING",
    "BYTES",
    "INTEGER",
    "INT64",
    "FLOAT",
    "FLOAT64",
    "NUMERIC",
    "BIGNUMERIC",
    "BOOLEAN",
    "BOOL",
    "TIMESTAMP",
    "DATE",
    "TIME",
    "DATETIME",
    "GEOGRAPHY",
    "JSON",
    "RECORD",
    "STRUCT",
];

/// Field mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// One column of the schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            mode,
            fields: Vec::new(),
            description: None,
        }
    }

    fn is_record(&self) -> bool {
        matches!(self.field_type.to_uppercase().as_str(), "RECORD" | "STRUCT")
    }
}

/// Ordered field list for every partition table of one log kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl SchemaDefinition {
    /// Load `schema_<name>.json` from `dir`
    pub fn load(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = dir.as_ref().join(format!("schema_{}.json", name));
        if !path.exists() {
            return Err(TracklogError::SchemaNotFound(path.display().to_string()));
        }

        let text = std::fs::read_to_string(&path)?;
        let schema = Self::from_json_str(name, &text)?;

        tracing::debug!(
            schema = %name,
            path = %path.display(),
            fields = schema.fields.len(),
            "Loaded schema"
        );

        Ok(schema)
    }

    /// Parse a schema resource document and pick the entry named `name`
    pub fn from_json_str(name: &str, text: &str) -> Result<Self> {
        let mut document: HashMap<String, Vec<FieldDefinition>> = serde_json::from_str(text)?;
        let fields = document.remove(name).ok_or_else(|| {
            TracklogError::Schema(format!("schema document has no '{}' entry", name))
        })?;

        let schema = Self {
            name: name.to_string(),
            fields,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Schema shipped with the workspace, used when no override directory exists
    pub fn builtin(name: &str) -> Result<Self> {
        match name {
            TRACKING_LOG_SCHEMA => Self::from_json_str(name, BUILTIN_TRACKING_LOG),
            other => Err(TracklogError::SchemaNotFound(format!("builtin:{}", other))),
        }
    }

    /// Load from `dir` when given, otherwise fall back to the builtin schema
    pub fn resolve(dir: Option<&Path>, name: &str) -> Result<Self> {
        match dir {
            Some(dir) => Self::load(dir, name),
            None => Self::builtin(name),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(TracklogError::Schema(format!(
                "schema '{}' has no fields",
                self.name
            )));
        }
        validate_fields(&self.name, &self.fields)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

fn validate_fields(path: &str, fields: &[FieldDefinition]) -> Result<()> {
    // Column names are case-insensitive in the warehouse
    let mut seen = HashSet::new();

    for field in fields {
        let qualified = format!("{}.{}", path, field.name);

        if field.name.is_empty() {
            return Err(TracklogError::Schema(format!("empty field name under {}", path)));
        }
        if !seen.insert(field.name.to_lowercase()) {
            return Err(TracklogError::Schema(format!("duplicate field {}", qualified)));
        }
        if !KNOWN_TYPES.contains(&field.field_type.to_uppercase().as_str()) {
            return Err(TracklogError::Schema(format!(
                "unknown type '{}' for {}",
                field.field_type, qualified
            )));
        }

        match (field.is_record(), field.fields.is_empty()) {
            (true, true) => {
                return Err(TracklogError::Schema(format!(
                    "record field {} has no nested fields",
                    qualified
                )));
            },
            (false, false) => {
                return Err(TracklogError::Schema(format!(
                    "non-record field {} declares nested fields",
                    qualified
                )));
            },
            (true, false) => validate_fields(&qualified, &field.fields)?,
            (false, true) => {},
        }
    }

    Ok(())
}
