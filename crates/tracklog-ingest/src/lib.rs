//! Tracklog Ingest Library
//!
//! Incremental loader for per-course tracking log files. Files are listed
//! from a local directory or an object store, attributed to a day by their
//! name, compared against the matching `tracklog_YYYYMMDD` partition table
//! and loaded only when the table is absent or older than the file.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracklog_common::{types::DatePattern, SchemaDefinition};
//! use tracklog_ingest::{
//!     BigQueryWarehouse, IngestConfig, LocalLister, Orchestrator, RunRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let lister = LocalLister::new("/var/log/tracking", DatePattern::default_pattern()?);
//!     let warehouse = BigQueryWarehouse::new(&config.warehouse)?;
//!     let schema = SchemaDefinition::builtin("tracking_log")?;
//!
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(lister),
//!         Arc::new(warehouse),
//!         Arc::new(schema),
//!         &config,
//!     );
//!     let summary = orchestrator.run(&RunRequest::new("edX/DemoX/Demo")).await?;
//!     println!("{:?}", summary.counts());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod decision;
pub mod error;
pub mod loader;
pub mod naming;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod summary;
pub mod warehouse;

pub use config::{IngestConfig, SourceKind};
pub use decision::{decide, decide_with, DecisionKind, FreshnessCheck, LoadDecision};
pub use error::{IngestError, Result, RowError};
pub use loader::{LoadResult, LoadTarget, Loader, LoaderSettings};
pub use naming::{DatasetNamer, LogsDatasetNamer};
pub use orchestrator::{resolve_date_range, Orchestrator, RunOptions, RunRequest};
pub use retry::RetryPolicy;
pub use source::{LoadSource, LocalLister, ObjectStore, RemoteLister, S3ObjectStore, SourceLister};
pub use summary::{FileOutcome, FileReport, NotAttemptedReason, RunCounts, RunState, RunSummary};
pub use warehouse::{BigQueryWarehouse, JobHandle, JobStatus, LoadRequest, StateResolver, Warehouse};
