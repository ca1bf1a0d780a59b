//! Shared fakes for tracklog-ingest integration tests
//!
//! - [`MemoryWarehouse`]: in-memory datasets, tables and load jobs. A load
//!   stamps its table with the current time, like a real warehouse would.
//!   Jobs can be held running until first polled, which records any job
//!   submitted to the same table while another one is still running.
//! - [`MemoryObjectStore`]: sorted key space with S3 listing semantics
//!   (prefix, delimiter, start-after, paging).

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracklog_common::LoadMode;
use tracklog_ingest::config::IngestConfig;
use tracklog_ingest::error::{IngestError, Result, RowError};
use tracklog_ingest::source::{ListObjectsRequest, ObjectEntry, ObjectPage, ObjectStore};
use tracklog_ingest::warehouse::{JobHandle, JobStatus, LoadRequest, Warehouse};

pub const COURSE_ID: &str = "edX/DemoX/Demo";
pub const DATASET_ID: &str = "edX__DemoX__Demo_logs";

/// Payload bigger than the empty-file threshold
pub const EVENT_LINES: &str = "{\"event_type\":\"play_video\",\"username\":\"staff\"}\n{\"event_type\":\"pause_video\",\"username\":\"staff\"}\n";

pub fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

/// Configuration with fast retries and polling
pub fn test_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.warehouse.project_id = Some("test-project".to_string());
    config.retry.max_attempts = 3;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.load.poll_interval_ms = 5;
    config.load.job_timeout_secs = 5;
    config.load.wait = true;
    config.run.workers = 1;
    config
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLoad {
    pub job_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub mode: LoadMode,
    pub bytes: usize,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    datasets: Mutex<BTreeSet<String>>,
    tables: Mutex<BTreeMap<(String, String), DateTime<Utc>>>,
    jobs: Mutex<HashMap<String, JobStatus>>,
    loads: Mutex<Vec<RecordedLoad>>,
    failing_tables: Mutex<BTreeSet<String>>,
    submit_failures: Mutex<u32>,
    submit_attempts: Mutex<u32>,
    submit_delay: Mutex<Duration>,
    hold_jobs: Mutex<bool>,
    running: Mutex<HashMap<String, (String, String, LoadMode)>>,
    overlaps: Mutex<Vec<String>>,
    cancel_on_submit: Mutex<Option<CancellationToken>>,
}

impl MemoryWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_table(&self, dataset_id: &str, table_id: &str, modified: DateTime<Utc>) {
        self.datasets.lock().unwrap().insert(dataset_id.to_string());
        self.tables
            .lock()
            .unwrap()
            .insert((dataset_id.to_string(), table_id.to_string()), modified);
    }

    pub fn table_modified(&self, dataset_id: &str, table_id: &str) -> Option<DateTime<Utc>> {
        self.tables
            .lock()
            .unwrap()
            .get(&(dataset_id.to_string(), table_id.to_string()))
            .copied()
    }

    pub fn has_dataset(&self, dataset_id: &str) -> bool {
        self.datasets.lock().unwrap().contains(dataset_id)
    }

    /// Jobs loading into `table_id` finish with a data error
    pub fn fail_table(&self, table_id: &str) {
        self.failing_tables.lock().unwrap().insert(table_id.to_string());
    }

    /// The next `count` submissions fail transiently
    pub fn fail_next_submits(&self, count: u32) {
        *self.submit_failures.lock().unwrap() = count;
    }

    /// Every submission takes `delay` to be answered
    pub fn delay_submits(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    /// Jobs report RUNNING until their first poll
    pub fn hold_jobs_until_polled(&self) {
        *self.hold_jobs.lock().unwrap() = true;
    }

    /// Jobs submitted while an earlier job on the same table was running
    pub fn overlaps(&self) -> Vec<String> {
        self.overlaps.lock().unwrap().clone()
    }

    /// Cancel `token` once a submission has been accepted
    pub fn cancel_on_submit(&self, token: CancellationToken) {
        *self.cancel_on_submit.lock().unwrap() = Some(token);
    }

    pub fn loads(&self) -> Vec<RecordedLoad> {
        self.loads.lock().unwrap().clone()
    }

    pub fn submit_attempts(&self) -> u32 {
        *self.submit_attempts.lock().unwrap()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_dataset(&self, dataset_id: &str) -> Result<()> {
        self.datasets.lock().unwrap().insert(dataset_id.to_string());
        Ok(())
    }

    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .keys()
            .filter(|(dataset, _)| dataset == dataset_id)
            .map(|(_, table)| table.clone())
            .collect())
    }

    async fn table_last_modified(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.table_modified(dataset_id, table_id))
    }

    async fn submit_load(&self, request: LoadRequest) -> Result<JobHandle> {
        *self.submit_attempts.lock().unwrap() += 1;
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.submit_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(IngestError::from_status(503, "backend unavailable"));
            }
        }

        let data = request.source.read().await?;
        let rows = data.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count() as u64;

        let status = if self.failing_tables.lock().unwrap().contains(&request.table_id) {
            JobStatus::Done {
                rows_loaded: None,
                errors: vec![RowError {
                    reason: "invalid".to_string(),
                    location: Some("line 1".to_string()),
                    message: "JSON parsing error".to_string(),
                }],
                failure: Some("invalid: too many errors".to_string()),
            }
        } else {
            self.tables.lock().unwrap().insert(
                (request.dataset_id.clone(), request.table_id.clone()),
                Utc::now(),
            );
            JobStatus::Done {
                rows_loaded: Some(rows),
                errors: vec![],
                failure: None,
            }
        };

        {
            let mut running = self.running.lock().unwrap();
            for (dataset_id, table_id, mode) in running.values() {
                if *dataset_id == request.dataset_id && *table_id == request.table_id {
                    self.overlaps.lock().unwrap().push(format!(
                        "{} {:?} submitted while a {:?} job was running",
                        table_id, request.mode, mode
                    ));
                }
            }
            if *self.hold_jobs.lock().unwrap() {
                running.insert(
                    request.job_id.clone(),
                    (request.dataset_id.clone(), request.table_id.clone(), request.mode),
                );
            }
        }

        self.jobs.lock().unwrap().insert(request.job_id.clone(), status);
        self.loads.lock().unwrap().push(RecordedLoad {
            job_id: request.job_id.clone(),
            dataset_id: request.dataset_id,
            table_id: request.table_id,
            mode: request.mode,
            bytes: data.len(),
        });

        if let Some(token) = self.cancel_on_submit.lock().unwrap().as_ref() {
            token.cancel();
        }

        Ok(JobHandle {
            job_id: request.job_id,
            location: None,
        })
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        if self.running.lock().unwrap().remove(&job.job_id).is_some() {
            return Ok(JobStatus::Running);
        }
        self.jobs
            .lock()
            .unwrap()
            .get(&job.job_id)
            .cloned()
            .ok_or_else(|| IngestError::Warehouse {
                status: 404,
                message: format!("job {} not found", job.job_id),
            })
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

enum Listed {
    Object(ObjectEntry),
    Folder(String),
}

impl Listed {
    fn key(&self) -> &str {
        match self {
            Listed::Object(entry) => &entry.key,
            Listed::Folder(prefix) => prefix,
        }
    }
}

pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    requests: Mutex<Vec<ListObjectsRequest>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Arc<Self> {
        Arc::new(Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn put(&self, key: &str, data: &[u8], last_modified: DateTime<Utc>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                last_modified,
            },
        );
    }

    pub fn requests(&self) -> Vec<ListObjectsRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(&self, request: &ListObjectsRequest) -> Result<ObjectPage> {
        self.requests.lock().unwrap().push(request.clone());
        let objects = self.objects.lock().unwrap();

        let mut listed: Vec<Listed> = Vec::new();
        for (key, object) in objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            if let Some(after) = &request.start_after {
                if key.as_str() <= after.as_str() {
                    continue;
                }
            }

            let rest = &key[request.prefix.len()..];
            match request.delimiter.as_deref().and_then(|d| rest.find(d).map(|i| (d, i))) {
                Some((delimiter, index)) => {
                    let folder = format!("{}{}", request.prefix, &rest[..index + delimiter.len()]);
                    if listed.last().map(|l| l.key() != folder).unwrap_or(true) {
                        listed.push(Listed::Folder(folder));
                    }
                },
                None => listed.push(Listed::Object(ObjectEntry {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: object.last_modified,
                })),
            }
        }

        let offset: usize = request
            .page_token
            .as_deref()
            .map(|t| t.parse().unwrap())
            .unwrap_or(0);
        let max_keys = request.max_keys.max(1) as usize;
        let total = listed.len();
        let start = offset.min(total);
        let end = (offset + max_keys).min(total);

        let mut page = ObjectPage::default();
        for item in listed.drain(start..end) {
            match item {
                Listed::Object(entry) => page.entries.push(entry),
                Listed::Folder(prefix) => page.common_prefixes.push(prefix),
            }
        }
        if end < total {
            page.next_page_token = Some(end.to_string());
        }
        Ok(page)
    }

    async fn download_object(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| IngestError::Transient(format!("NoSuchKey: {}", key)))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
