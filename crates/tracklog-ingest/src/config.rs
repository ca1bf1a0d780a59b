//! Ingest configuration
//!
//! Resolved once per process from environment variables (after `.env` is
//! loaded), optionally overridden by CLI flags, then frozen in an `Arc` and
//! shared by every run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracklog_common::schema::TRACKING_LOG_SCHEMA;
use tracklog_common::types::{DatePattern, DEFAULT_DATE_FORMAT, DEFAULT_DATE_REGEX};

use crate::error::{IngestError, Result};

/// Where candidate files come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Remote,
}

/// Main ingest configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    pub source: SourceConfig,
    pub warehouse: WarehouseConfig,
    pub load: LoadConfig,
    pub retry: RetryConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Root of local tracking logs; files live in `<logs_root>/<course_id>/`
    pub logs_root: Option<PathBuf>,
    /// Treat a missing course directory as an empty listing
    pub allow_missing_source: bool,
    pub date_pattern: String,
    pub date_format: String,
    pub s3: S3Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: Option<String>,
    /// Key prefix holding one folder per log-producing server
    pub prefix: Option<String>,
    /// File name prefix inside each server folder, e.g. `tracking.log-`
    pub file_name_pattern: String,
    pub page_size: i32,
    /// Download objects here before loading instead of keeping them in memory
    pub download_dir: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub project_id: Option<String>,
    pub base_url: String,
    pub location: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Directory holding `schema_<name>.json`; the builtin schema is used when unset
    pub schema_dir: Option<PathBuf>,
    pub schema_name: String,
    pub max_bad_records: u32,
    pub wait: bool,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    /// Compare table and file timestamps before trusting an existing table
    pub check_dates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub workers: usize,
    pub stop_on_error: bool,
    /// Cancel the run after this many seconds
    pub run_timeout_secs: Option<u64>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| IngestError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            source: SourceConfig::from_env()?,
            warehouse: WarehouseConfig::from_env()?,
            load: LoadConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            run: RunConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks that hold regardless of the source kind
    pub fn validate(&self) -> Result<()> {
        if self.run.workers == 0 {
            return Err(IngestError::Config("TRACKLOG_WORKERS must be greater than 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::Config(
                "TRACKLOG_MAX_RETRIES must be greater than 0".into(),
            ));
        }
        if self.load.poll_interval_ms == 0 {
            return Err(IngestError::Config(
                "TRACKLOG_JOB_POLL_INTERVAL_MS must be greater than 0".into(),
            ));
        }
        if self.load.job_timeout_secs == 0 {
            return Err(IngestError::Config(
                "TRACKLOG_JOB_TIMEOUT_SECS must be greater than 0".into(),
            ));
        }
        if self.load.schema_name.is_empty() {
            return Err(IngestError::Config("TRACKLOG_SCHEMA_NAME cannot be empty".into()));
        }
        if self.source.s3.page_size <= 0 || self.source.s3.page_size > 1000 {
            return Err(IngestError::Config(
                "TRACKLOG_S3_PAGE_SIZE must be between 1 and 1000".into(),
            ));
        }
        self.source.date_pattern()?;
        Ok(())
    }

    /// Checks required before running against a given source
    pub fn validate_for(&self, kind: SourceKind) -> Result<()> {
        self.validate()?;

        if self.warehouse.project_id.is_none() {
            return Err(IngestError::Config("BIGQUERY_PROJECT is not set".into()));
        }

        match kind {
            SourceKind::Local => {
                if self.source.logs_root.is_none() {
                    return Err(IngestError::Config(
                        "TRACKLOG_LOGS_DIR is required for local files".into(),
                    ));
                }
            },
            SourceKind::Remote => {
                if self.source.s3.bucket.is_none() {
                    return Err(IngestError::Config("S3_BUCKET is not set".into()));
                }
                if self.source.s3.prefix.is_none() {
                    return Err(IngestError::Config("TRACKLOG_S3_PREFIX is not set".into()));
                }
            },
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.load.job_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.load.poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run.run_timeout_secs.map(Duration::from_secs)
    }
}

impl SourceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            logs_root: env_opt("TRACKLOG_LOGS_DIR").map(PathBuf::from),
            allow_missing_source: env_parse("TRACKLOG_ALLOW_MISSING_SOURCE", false)?,
            date_pattern: env_opt("TRACKLOG_DATE_PATTERN").unwrap_or(defaults.date_pattern),
            date_format: env_opt("TRACKLOG_DATE_FORMAT").unwrap_or(defaults.date_format),
            s3: S3Config::from_env()?,
        })
    }

    /// Compile the configured date pattern
    pub fn date_pattern(&self) -> Result<DatePattern> {
        Ok(DatePattern::new(&self.date_pattern, self.date_format.clone())?)
    }
}

impl S3Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bucket: env_opt("S3_BUCKET"),
            prefix: env_opt("TRACKLOG_S3_PREFIX"),
            file_name_pattern: env_opt("TRACKLOG_FILE_NAME_PATTERN")
                .unwrap_or(defaults.file_name_pattern),
            page_size: env_parse("TRACKLOG_S3_PAGE_SIZE", defaults.page_size)?,
            download_dir: env_opt("TRACKLOG_DOWNLOAD_DIR").map(PathBuf::from),
            endpoint: env_opt("S3_ENDPOINT"),
            region: env_opt("S3_REGION").unwrap_or(defaults.region),
            access_key: env_opt("S3_ACCESS_KEY"),
            secret_key: env_opt("S3_SECRET_KEY"),
            path_style: env_parse("S3_PATH_STYLE", defaults.path_style)?,
        })
    }
}

impl WarehouseConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            project_id: env_opt("BIGQUERY_PROJECT"),
            base_url: env_opt("BIGQUERY_BASE_URL").unwrap_or(defaults.base_url),
            location: env_opt("BIGQUERY_LOCATION"),
            access_token: env_opt("BIGQUERY_ACCESS_TOKEN"),
            http_timeout_secs: env_parse("BIGQUERY_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl LoadConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            schema_dir: env_opt("TRACKLOG_SCHEMA_DIR").map(PathBuf::from),
            schema_name: env_opt("TRACKLOG_SCHEMA_NAME").unwrap_or(defaults.schema_name),
            max_bad_records: env_parse("TRACKLOG_MAX_BAD_RECORDS", defaults.max_bad_records)?,
            wait: env_parse("TRACKLOG_WAIT", defaults.wait)?,
            poll_interval_ms: env_parse("TRACKLOG_JOB_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            job_timeout_secs: env_parse("TRACKLOG_JOB_TIMEOUT_SECS", defaults.job_timeout_secs)?,
            check_dates: env_parse("TRACKLOG_CHECK_DATES", defaults.check_dates)?,
        })
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: env_parse("TRACKLOG_MAX_RETRIES", defaults.max_attempts)?,
            initial_backoff_ms: env_parse("TRACKLOG_RETRY_BACKOFF_MS", defaults.initial_backoff_ms)?,
            max_backoff_ms: env_parse("TRACKLOG_RETRY_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
        })
    }
}

impl RunConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            workers: env_parse("TRACKLOG_WORKERS", defaults.workers)?,
            stop_on_error: env_parse("TRACKLOG_STOP_ON_ERROR", defaults.stop_on_error)?,
            run_timeout_secs: match env_opt("TRACKLOG_RUN_TIMEOUT_SECS") {
                Some(_) => Some(env_parse("TRACKLOG_RUN_TIMEOUT_SECS", 0u64)?),
                None => None,
            },
        })
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            logs_root: None,
            allow_missing_source: false,
            date_pattern: DEFAULT_DATE_REGEX.to_string(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            s3: S3Config::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: None,
            file_name_pattern: "tracking.log-".to_string(),
            page_size: 1000,
            download_dir: None,
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            base_url: "https://bigquery.googleapis.com".to_string(),
            location: None,
            access_token: None,
            http_timeout_secs: 300,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            schema_dir: None,
            schema_name: TRACKING_LOG_SCHEMA.to_string(),
            max_bad_records: 1000,
            wait: false,
            poll_interval_ms: 2000,
            job_timeout_secs: 3600,
            check_dates: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            stop_on_error: false,
            run_timeout_secs: None,
        }
    }
}
