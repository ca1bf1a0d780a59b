//! Ingest error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracklog_common::TracklogError;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// One rejected row reported by the warehouse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub reason: String,
    pub location: Option<String>,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum IngestError {
    /// Invalid or missing configuration, raised before any I/O
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listing the source failed for the whole run
    #[error("Enumeration error: {0}")]
    Enumeration(String),

    /// Network, auth or throttling failure that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Load rejected by the warehouse, not retried
    #[error("Data error loading {table}: {message}")]
    Data {
        table: String,
        message: String,
        row_errors: Vec<RowError>,
    },

    /// Non-transient warehouse API failure
    #[error("Warehouse error (HTTP {status}): {message}")]
    Warehouse { status: u16, message: String },

    /// Object storage refused the request in a way retrying cannot fix
    #[error("Storage error ({code}): {message}")]
    Storage { code: String, message: String },

    #[error("Terminal state of job {job_id} is unknown")]
    JobStateUnknown { job_id: String },

    #[error("Run cancelled")]
    Cancelled,

    /// A per-file failure escalated by stop-on-error
    #[error("Run for {course_id} aborted: {cause}")]
    Aborted { course_id: String, cause: String },

    #[error(transparent)]
    Common(#[from] TracklogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Build the error for a warehouse HTTP status, classifying retryable codes
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 | 408 | 429 | 500..=599 => {
                IngestError::Transient(format!("HTTP {}: {}", status, message))
            },
            _ => IngestError::Warehouse { status, message },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }

    /// Errors that end the whole run instead of a single file
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Config(_)
                | IngestError::Enumeration(_)
                | IngestError::Common(_)
                | IngestError::Cancelled
                | IngestError::Aborted { .. }
        )
    }

    /// Short machine-readable label used in run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Config(_) => "config",
            IngestError::Enumeration(_) => "enumeration",
            IngestError::Transient(_) => "transient",
            IngestError::Data { .. } => "data",
            IngestError::Warehouse { .. } => "warehouse",
            IngestError::Storage { .. } => "storage",
            IngestError::JobStateUnknown { .. } => "job_state_unknown",
            IngestError::Cancelled => "cancelled",
            IngestError::Aborted { .. } => "aborted",
            IngestError::Common(_) => "common",
            IngestError::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => IngestError::from_status(status.as_u16(), err.to_string()),
            None if err.is_decode() => IngestError::Warehouse {
                status: 0,
                message: format!("Malformed response: {}", err),
            },
            None => IngestError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Common(TracklogError::Serialization(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(IngestError::from_status(503, "unavailable").is_transient());
        assert!(IngestError::from_status(429, "rate limited").is_transient());
        assert!(IngestError::from_status(401, "expired token").is_transient());
        assert!(!IngestError::from_status(400, "bad schema").is_transient());
        assert!(!IngestError::from_status(404, "missing").is_transient());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(IngestError::Config("no prefix".into()).is_fatal());
        assert!(IngestError::Enumeration("no dir".into()).is_fatal());
        assert!(!IngestError::Transient("timeout".into()).is_fatal());
        assert!(!IngestError::JobStateUnknown { job_id: "j1".into() }.is_fatal());
        let data = IngestError::Data {
            table: "tracklog_20190613".into(),
            message: "too many errors".into(),
            row_errors: vec![],
        };
        assert!(!data.is_fatal());
        assert_eq!(data.kind(), "data");
    }
}
