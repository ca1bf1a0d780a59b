//! Error types shared by the tracklog crates

use thiserror::Error;

/// Result type alias for tracklog operations
pub type Result<T> = std::result::Result<T, TracklogError>;

/// Errors raised while building the domain model (schemas, date patterns, config values)
#[derive(Error, Debug)]
pub enum TracklogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid date pattern '{pattern}': {reason}")]
    InvalidDatePattern { pattern: String, reason: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
