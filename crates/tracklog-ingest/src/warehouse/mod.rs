//! Warehouse access
//!
//! [`Warehouse`] is the narrow surface the pipeline needs from the analytical
//! warehouse. [`StateResolver`] builds partition table descriptors on top of
//! it, always from live warehouse state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};
use tracklog_common::types::parse_partition_table_id;
use tracklog_common::{LoadMode, SchemaDefinition, TableDescriptor};

use crate::error::{Result, RowError};
use crate::source::LoadSource;

pub mod bigquery;

pub use bigquery::BigQueryWarehouse;

/// A load job to submit
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Client-chosen job id, reused across submission retries
    pub job_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub schema: Arc<SchemaDefinition>,
    pub source: LoadSource,
    pub mode: LoadMode,
    pub max_bad_records: u32,
}

/// Handle of a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done {
        rows_loaded: Option<u64>,
        /// Rejected rows, tolerated up to the bad-record threshold
        errors: Vec<RowError>,
        /// Set when the job as a whole failed
        failure: Option<String>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done { .. })
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the dataset if it does not exist
    async fn ensure_dataset(&self, dataset_id: &str) -> Result<()>;

    /// Table ids of the dataset; a missing dataset has none
    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>>;

    /// Last modification time, `None` when the table does not exist
    async fn table_last_modified(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn submit_load(&self, request: LoadRequest) -> Result<JobHandle>;

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus>;
}

/// Resolves partition table state for one dataset
#[derive(Clone)]
pub struct StateResolver {
    warehouse: Arc<dyn Warehouse>,
}

impl StateResolver {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Partition tables (`tracklog_YYYYMMDD`) of the dataset
    #[instrument(skip(self))]
    pub async fn list_partition_tables(&self, dataset_id: &str) -> Result<BTreeSet<String>> {
        let tables: BTreeSet<String> = self
            .warehouse
            .list_tables(dataset_id)
            .await?
            .into_iter()
            .filter(|t| parse_partition_table_id(t).is_some())
            .collect();

        debug!(dataset = %dataset_id, tables = tables.len(), "Resolved partition tables");
        Ok(tables)
    }

    /// Fresh descriptor for one table.
    ///
    /// A table missing from `known` is still looked up, since it may have
    /// been created after the initial listing.
    #[instrument(skip(self, known))]
    pub async fn describe(
        &self,
        dataset_id: &str,
        table_id: &str,
        known: &BTreeSet<String>,
    ) -> Result<TableDescriptor> {
        let last_modified_at = self
            .warehouse
            .table_last_modified(dataset_id, table_id)
            .await?;

        if last_modified_at.is_none() && known.contains(table_id) {
            debug!(table = %table_id, "Listed table is no longer visible, treating as absent");
        }

        Ok(TableDescriptor::new(dataset_id, table_id, last_modified_at))
    }
}
