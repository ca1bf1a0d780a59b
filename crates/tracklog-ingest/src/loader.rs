//! Single-file loader
//!
//! Submits one load job and, when asked to wait, polls it to a terminal
//! state. A job is never resubmitted once accepted: polling failures are
//! logged and polling continues until the job timeout.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tracklog_common::{LoadMode, SchemaDefinition};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result, RowError};
use crate::retry::RetryPolicy;
use crate::source::LoadSource;
use crate::warehouse::{JobHandle, JobStatus, LoadRequest, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    pub max_bad_records: u32,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for LoaderSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_bad_records: config.load.max_bad_records,
            poll_interval: config.poll_interval(),
            job_timeout: config.job_timeout(),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Outcome of one load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub job_id: String,
    pub rows_loaded: Option<u64>,
    /// Rows rejected but tolerated under the bad-record threshold
    pub errors: Vec<RowError>,
    /// False when the job was submitted without waiting
    pub completed: bool,
}

/// Target of one load job
#[derive(Debug, Clone)]
pub struct LoadTarget<'a> {
    pub dataset_id: &'a str,
    pub table_id: &'a str,
    pub mode: LoadMode,
}

#[derive(Clone)]
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    settings: LoaderSettings,
}

fn new_job_id(table_id: &str) -> String {
    format!("{}_{}", table_id, uuid::Uuid::new_v4().simple())
}

impl Loader {
    pub fn new(warehouse: Arc<dyn Warehouse>, settings: LoaderSettings) -> Self {
        Self {
            warehouse,
            settings,
        }
    }

    /// Load `source` into the target table.
    ///
    /// Submission is retried on transient failures with the same job id.
    /// Cancellation after a submission attempt leaves the job state unknown,
    /// since a failed attempt may still have been accepted. With `wait` the
    /// call returns only once the job is done, failed, or its state became
    /// unknown through timeout or cancellation.
    #[instrument(skip(self, schema, source, cancel), fields(dataset = %target.dataset_id, table = %target.table_id, mode = %target.mode))]
    pub async fn load(
        &self,
        target: LoadTarget<'_>,
        schema: Arc<SchemaDefinition>,
        source: LoadSource,
        wait: bool,
        cancel: &CancellationToken,
    ) -> Result<LoadResult> {
        let request = LoadRequest {
            job_id: new_job_id(target.table_id),
            dataset_id: target.dataset_id.to_string(),
            table_id: target.table_id.to_string(),
            schema,
            source,
            mode: target.mode,
            max_bad_records: self.settings.max_bad_records,
        };

        debug!(job_id = %request.job_id, source = %request.source.describe(), "Submitting load job");
        let warehouse = self.warehouse.clone();
        let attempts = AtomicU32::new(0);
        let submitted = self
            .settings
            .retry
            .run("submit load job", cancel, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let warehouse = warehouse.clone();
                let request = request.clone();
                async move { warehouse.submit_load(request).await }
            })
            .await;

        let job = match submitted {
            Ok(job) => job,
            Err(IngestError::Cancelled) if attempts.load(Ordering::SeqCst) > 0 => {
                warn!(job_id = %request.job_id, "Cancelled between submission attempts");
                return Err(IngestError::JobStateUnknown {
                    job_id: request.job_id,
                });
            },
            Err(e) => return Err(e),
        };

        if !wait {
            info!(job_id = %job.job_id, "Load job submitted, not waiting");
            return Ok(LoadResult {
                job_id: job.job_id,
                rows_loaded: None,
                errors: Vec::new(),
                completed: false,
            });
        }

        self.wait_for(&job, target.table_id, cancel).await
    }

    async fn wait_for(
        &self,
        job: &JobHandle,
        table_id: &str,
        cancel: &CancellationToken,
    ) -> Result<LoadResult> {
        let deadline = Instant::now() + self.settings.job_timeout;
        let unknown = || IngestError::JobStateUnknown {
            job_id: job.job_id.clone(),
        };

        loop {
            if Instant::now() >= deadline {
                warn!(job_id = %job.job_id, "Timed out waiting for load job");
                return Err(unknown());
            }

            match self.warehouse.job_status(job).await {
                Ok(status) if status.is_terminal() => return finish(job, table_id, status),
                Ok(status) => debug!(job_id = %job.job_id, ?status, "Load job in progress"),
                Err(e) => warn!(job_id = %job.job_id, error = %e, "Polling load job failed, will poll again"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(job_id = %job.job_id, "Cancelled while waiting for load job");
                    return Err(unknown());
                },
                _ = tokio::time::sleep(self.settings.poll_interval.min(remaining)) => {},
            }
        }
    }
}

/// Turn a terminal job status into the load outcome
fn finish(job: &JobHandle, table_id: &str, status: JobStatus) -> Result<LoadResult> {
    match status {
        JobStatus::Done {
            failure: Some(message),
            errors,
            ..
        } => Err(IngestError::Data {
            table: table_id.to_string(),
            message,
            row_errors: errors,
        }),
        JobStatus::Done {
            rows_loaded,
            errors,
            failure: None,
        } => {
            if !errors.is_empty() {
                warn!(
                    job_id = %job.job_id,
                    bad_rows = errors.len(),
                    "Load job completed with rejected rows"
                );
            }
            info!(job_id = %job.job_id, rows = ?rows_loaded, "Load job completed");
            Ok(LoadResult {
                job_id: job.job_id.clone(),
                rows_loaded,
                errors,
                completed: true,
            })
        },
        other => Err(IngestError::Warehouse {
            status: 0,
            message: format!("job {} is not finished: {:?}", job.job_id, other),
        }),
    }
}
