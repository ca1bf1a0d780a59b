//! BigQuery REST implementation of [`Warehouse`]
//!
//! Uses the v2 REST API directly. Load jobs are submitted as a multipart
//! upload carrying the job configuration and the file contents. The bearer
//! token is supplied from outside (for example `gcloud auth print-access-token`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use tracklog_common::LoadMode;

use super::{JobHandle, JobStatus, LoadRequest, Warehouse};
use crate::config::WarehouseConfig;
use crate::error::{IngestError, Result, RowError};

const TABLES_PAGE_SIZE: u32 = 1000;

#[derive(Clone)]
pub struct BigQueryWarehouse {
    client: Client,
    base_url: String,
    project_id: String,
    location: Option<String>,
    access_token: Option<String>,
}

impl BigQueryWarehouse {
    pub fn new(config: &WarehouseConfig) -> Result<Self> {
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| IngestError::Config("BIGQUERY_PROJECT is not set".to_string()))?;

        let client = Client::builder()
            .timeout(config.http_timeout())
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("tracklog-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project_id,
            location: config.location.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/bigquery/v2/projects/{}{}",
            self.base_url, self.project_id, path
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn load_configuration(&self, request: &LoadRequest) -> Value {
        let write_disposition = match request.mode {
            LoadMode::Append => "WRITE_APPEND",
            LoadMode::Replace => "WRITE_TRUNCATE",
        };

        let mut job_reference = json!({
            "projectId": self.project_id,
            "jobId": request.job_id,
        });
        if let Some(location) = &self.location {
            job_reference["location"] = json!(location);
        }

        json!({
            "jobReference": job_reference,
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.project_id,
                        "datasetId": request.dataset_id,
                        "tableId": request.table_id,
                    },
                    "schema": { "fields": request.schema.fields },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": write_disposition,
                    "createDisposition": "CREATE_IF_NEEDED",
                    "maxBadRecords": request.max_bad_records,
                    "ignoreUnknownValues": true,
                }
            }
        })
    }
}

/// Turn a non-success response into an error, keeping the API message
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    Err(IngestError::from_status(status.as_u16(), message))
}

fn multipart_body(boundary: &str, metadata: &Value, data: &[u8]) -> Vec<u8> {
    let head = format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n--{b}\r\nContent-Type: application/octet-stream\r\n\r\n",
        b = boundary,
        meta = metadata
    );
    let tail = format!("\r\n--{}--\r\n", boundary);

    let mut body = Vec::with_capacity(head.len() + data.len() + tail.len());
    body.extend_from_slice(head.as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(tail.as_bytes());
    body
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    /// Milliseconds since the epoch, encoded as a string
    last_modified_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: Option<JobReference>,
    status: Option<JobStatusResource>,
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResource {
    state: String,
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    location: Option<String>,
    message: Option<String>,
}

impl From<ErrorProto> for RowError {
    fn from(e: ErrorProto) -> Self {
        RowError {
            reason: e.reason.unwrap_or_default(),
            location: e.location,
            message: e.message.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

impl JobResource {
    fn into_status(self) -> Result<JobStatus> {
        let status = self
            .status
            .ok_or_else(|| IngestError::from_status(502, "job resource has no status"))?;

        match status.state.as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => {
                let rows_loaded = self
                    .statistics
                    .and_then(|s| s.load)
                    .and_then(|l| l.output_rows)
                    .and_then(|rows| rows.parse().ok());
                let failure = status.error_result.map(|e| {
                    let e = RowError::from(e);
                    format!("{}: {}", e.reason, e.message)
                });
                Ok(JobStatus::Done {
                    rows_loaded,
                    errors: status.errors.into_iter().map(RowError::from).collect(),
                    failure,
                })
            },
            other => Err(IngestError::Warehouse {
                status: 0,
                message: format!("unknown job state '{}'", other),
            }),
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    #[instrument(skip(self))]
    async fn ensure_dataset(&self, dataset_id: &str) -> Result<()> {
        let url = self.api_url(&format!("/datasets/{}", dataset_id));
        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status().is_success() {
            debug!(dataset = %dataset_id, "Dataset exists");
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return check(response).await.map(|_| ());
        }

        let mut body = json!({
            "datasetReference": {
                "projectId": self.project_id,
                "datasetId": dataset_id,
            }
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        let response = self
            .authorize(self.client.post(self.api_url("/datasets")))
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            // Created concurrently by another run
            debug!(dataset = %dataset_id, "Dataset already exists");
            return Ok(());
        }
        check(response).await?;

        info!(dataset = %dataset_id, "Created dataset");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>> {
        let url = self.api_url(&format!("/datasets/{}/tables", dataset_id));
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .authorize(self.client.get(&url))
                .query(&[("maxResults", TABLES_PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                debug!(dataset = %dataset_id, "Dataset not visible yet, no tables");
                return Ok(Vec::new());
            }

            let page: TableList = check(response).await?.json().await?;
            tables.extend(page.tables.into_iter().map(|t| t.table_reference.table_id));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(tables)
    }

    #[instrument(skip(self))]
    async fn table_last_modified(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let url = self.api_url(&format!("/datasets/{}/tables/{}", dataset_id, table_id));
        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let table: TableResource = check(response).await?.json().await?;
        let millis = table
            .last_modified_time
            .and_then(|ms| ms.parse::<i64>().ok())
            .ok_or_else(|| IngestError::Warehouse {
                status: 0,
                message: format!("table {} has no lastModifiedTime", table_id),
            })?;

        Ok(DateTime::from_timestamp_millis(millis))
    }

    #[instrument(skip(self, request), fields(table = %request.table_id, mode = %request.mode, job_id = %request.job_id))]
    async fn submit_load(&self, request: LoadRequest) -> Result<JobHandle> {
        let data = request.source.read().await?;
        let metadata = self.load_configuration(&request);
        let boundary = format!("tracklog_{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, &metadata, &data);

        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.base_url, self.project_id
        );

        debug!(bytes = data.len(), "Submitting load job");
        let response = self
            .authorize(self.client.post(&url))
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            // Same job id already accepted, e.g. an earlier attempt whose response was lost
            warn!("Load job already exists, resuming it");
            return Ok(JobHandle {
                job_id: request.job_id,
                location: self.location.clone(),
            });
        }

        let job: JobResource = check(response).await?.json().await?;
        let handle = match job.job_reference {
            Some(reference) => JobHandle {
                job_id: reference.job_id,
                location: reference.location.or_else(|| self.location.clone()),
            },
            None => JobHandle {
                job_id: request.job_id,
                location: self.location.clone(),
            },
        };

        info!(job_id = %handle.job_id, "Load job submitted");
        Ok(handle)
    }

    #[instrument(skip(self))]
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        let url = self.api_url(&format!("/jobs/{}", job.job_id));
        let mut request = self.authorize(self.client.get(&url));
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }

        let response = request.send().await?;
        let resource: JobResource = check(response).await?.json().await?;
        resource.into_status()
    }
}
