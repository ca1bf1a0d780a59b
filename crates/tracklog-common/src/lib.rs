//! Tracklog Common Library
//!
//! Shared types, utilities, and error handling for the tracklog workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`TracklogError`] and the [`Result`] alias
//! - **Types**: file and partition-table descriptors, partition naming, date extraction
//! - **Schema**: the warehouse table schema loaded once per run
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use tracklog_common::types::{partition_table_id, DatePattern};
//!
//! fn table_for(name: &str) -> tracklog_common::Result<Option<String>> {
//!     let pattern = DatePattern::default_pattern()?;
//!     Ok(pattern.extract(name).map(partition_table_id))
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod schema;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TracklogError};
pub use schema::{FieldDefinition, FieldMode, SchemaDefinition};
pub use types::{FileDescriptor, LoadMode, TableDescriptor};
