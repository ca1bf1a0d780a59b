//! Tracklog Ingest - incremental tracking log loader

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracklog_common::logging::{init_logging, LogConfig, LogLevel};
use tracklog_common::SchemaDefinition;
use tracklog_ingest::{
    BigQueryWarehouse, IngestConfig, LocalLister, Orchestrator, RemoteLister, RetryPolicy,
    RunRequest, RunSummary, S3ObjectStore, SourceKind, SourceLister,
};

#[derive(Parser, Debug)]
#[command(name = "tracklog-ingest")]
#[command(author, version, about = "Load course tracking logs into daily warehouse tables")]
struct Cli {
    /// Course ids to process
    #[arg(required = true)]
    course_ids: Vec<String>,

    /// First day to load (YYYY-MM-DD), inclusive
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Last day to load (YYYY-MM-DD), inclusive
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Read logs from TRACKLOG_LOGS_DIR instead of object storage
    #[arg(long)]
    use_local_files: bool,

    /// Wait for each load job to finish
    #[arg(long)]
    wait: bool,

    /// Abort a course on its first failed file
    #[arg(long)]
    stop_on_error: bool,

    /// Partition tables loaded concurrently per course
    #[arg(long)]
    workers: Option<usize>,

    /// Skip the freshness comparison and only load missing tables
    #[arg(long)]
    no_check_dates: bool,

    /// Write the run summaries as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn source_kind(&self) -> SourceKind {
        if self.use_local_files {
            SourceKind::Local
        } else {
            SourceKind::Remote
        }
    }

    fn apply(&self, config: &mut IngestConfig) {
        if self.wait {
            config.load.wait = true;
        }
        if self.stop_on_error {
            config.run.stop_on_error = true;
        }
        if let Some(workers) = self.workers {
            config.run.workers = workers;
        }
        if self.no_check_dates {
            config.load.check_dates = false;
        }
    }
}

async fn build_lister(
    kind: SourceKind,
    config: &IngestConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn SourceLister>> {
    let pattern = config.source.date_pattern()?;

    match kind {
        SourceKind::Local => {
            let root = config
                .source
                .logs_root
                .clone()
                .context("TRACKLOG_LOGS_DIR is not set")?;
            let lister =
                LocalLister::new(root, pattern).allow_missing(config.source.allow_missing_source);
            Ok(Arc::new(lister))
        },
        SourceKind::Remote => {
            let s3 = &config.source.s3;
            let store = S3ObjectStore::new(s3).await?;
            let prefix = s3.prefix.clone().context("TRACKLOG_S3_PREFIX is not set")?;
            let lister = RemoteLister::new(Arc::new(store), prefix, s3.file_name_pattern.clone(), pattern)?
                .with_page_size(s3.page_size)
                .with_date_format(config.source.date_format.clone())
                .with_download_dir(s3.download_dir.clone())
                .with_retry(RetryPolicy::from(&config.retry))
                .with_cancel(cancel.clone());
            Ok(Arc::new(lister))
        },
    }
}

/// Cancel on Ctrl-C or when the run timeout elapses
fn spawn_cancel_triggers(config: &IngestConfig, cancel: &CancellationToken) {
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling runs");
            token.cancel();
        }
    });

    if let Some(timeout) = config.run_timeout() {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(timeout_secs = timeout.as_secs(), "Run timeout elapsed, cancelling runs");
            token.cancel();
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tracklog-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    cli.apply(&mut config);
    let kind = cli.source_kind();
    config.validate_for(kind)?;
    let config = Arc::new(config);

    let schema = SchemaDefinition::resolve(config.load.schema_dir.as_deref(), &config.load.schema_name)
        .with_context(|| format!("Failed to load schema '{}'", config.load.schema_name))?;

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&config, &cancel);

    let lister = build_lister(kind, &config, &cancel).await?;
    let warehouse = Arc::new(BigQueryWarehouse::new(&config.warehouse)?);
    let orchestrator =
        Orchestrator::new(lister, warehouse, Arc::new(schema), &config).with_cancel(cancel.clone());

    info!(courses = cli.course_ids.len(), source = ?kind, "Starting ingestion");

    let runs = cli.course_ids.iter().map(|course_id| {
        let request = RunRequest::new(course_id.clone()).with_dates(cli.start_date, cli.end_date);
        let orchestrator = &orchestrator;
        async move { (request.course_id.clone(), orchestrator.run(&request).await) }
    });
    let results = join_all(runs).await;

    let mut summaries: Vec<RunSummary> = Vec::new();
    let mut failed = 0usize;
    for (course_id, result) in results {
        match result {
            Ok(summary) => {
                if summary.is_aborted() {
                    error!(course = %course_id, cause = ?summary.abort_cause, "Course run aborted");
                    failed += 1;
                }
                summaries.push(summary);
            },
            Err(e) => {
                error!(course = %course_id, error = %e, "Course run failed");
                failed += 1;
            },
        }
    }

    if let Some(path) = &cli.summary_json {
        let json = serde_json::to_string_pretty(&summaries)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "Wrote run summary");
    }

    if failed > 0 {
        anyhow::bail!("{} of {} course runs failed", failed, cli.course_ids.len());
    }

    info!("Ingestion complete");
    Ok(())
}
