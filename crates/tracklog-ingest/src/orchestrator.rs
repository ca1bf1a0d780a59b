// Tracking log pipeline orchestrator
//
// Drives one course through listing, table resolution, decisions and loads.
// Files are grouped by partition table: files of one table run in order,
// distinct tables run concurrently through buffer_unordered.

use chrono::{Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracklog_common::{FileDescriptor, LoadMode, SchemaDefinition, TableDescriptor};

use crate::config::IngestConfig;
use crate::decision::{decide_with, DecisionKind, FreshnessCheck, LoadDecision};
use crate::error::{IngestError, Result};
use crate::loader::{LoadResult, LoadTarget, Loader, LoaderSettings};
use crate::naming::{DatasetNamer, LogsDatasetNamer};
use crate::retry::RetryPolicy;
use crate::source::SourceLister;
use crate::summary::{FileOutcome, FileReport, NotAttemptedReason, RunState, RunSummary};
use crate::warehouse::{StateResolver, Warehouse};

/// Days covered by default when a bound is missing
const DEFAULT_WINDOW_DAYS: i64 = 2;

/// One course to process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub course_id: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl RunRequest {
    pub fn new(course_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            start_date: None,
            end_date: None,
        }
    }

    pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }
}

/// Fill in missing bounds of the inclusive date range.
///
/// Neither bound: the last two days up to `today`. Only an end: the two days
/// before it. Only a start: up to `today`.
pub fn resolve_date_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate)> {
    let window = Duration::days(DEFAULT_WINDOW_DAYS);
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) => (s, e),
        (None, Some(e)) => (e - window, e),
        (Some(s), None) => (s, today),
        (None, None) => (today - window, today),
    };

    if start > end {
        return Err(IngestError::Config(format!(
            "start date {} is after end date {}",
            start, end
        )));
    }
    Ok((start, end))
}

/// Behaviour switches of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub wait: bool,
    pub stop_on_error: bool,
    pub workers: usize,
    pub freshness: FreshnessCheck,
    pub retry: RetryPolicy,
}

impl From<&IngestConfig> for RunOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            wait: config.load.wait,
            stop_on_error: config.run.stop_on_error,
            workers: config.run.workers.max(1),
            freshness: FreshnessCheck::from(config.load.check_dates),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

/// Shared per-run state handed to every partition task
struct RunContext<'a> {
    dataset_id: &'a str,
    known_tables: &'a BTreeSet<String>,
    abort: AtomicBool,
    abort_cause: Mutex<Option<String>>,
}

impl RunContext<'_> {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn trip(&self, cause: &IngestError) {
        self.abort.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.abort_cause.lock() {
            slot.get_or_insert_with(|| cause.to_string());
        }
    }
}

fn report(file: &FileDescriptor, decision: Option<LoadDecision>, outcome: FileOutcome) -> FileReport {
    FileReport {
        name: file.name.clone(),
        size_bytes: file.size_bytes,
        file_date: file.extracted_date,
        table_id: file.target_table_id(),
        decision,
        outcome,
    }
}

fn loaded(mode: LoadMode, result: LoadResult) -> FileOutcome {
    FileOutcome::Loaded {
        mode,
        job_id: result.job_id,
        rows_loaded: result.rows_loaded,
        bad_rows: result.errors,
        completed: result.completed,
    }
}

pub struct Orchestrator {
    lister: Arc<dyn SourceLister>,
    warehouse: Arc<dyn Warehouse>,
    resolver: StateResolver,
    loader: Loader,
    namer: Arc<dyn DatasetNamer>,
    schema: Arc<SchemaDefinition>,
    options: RunOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        lister: Arc<dyn SourceLister>,
        warehouse: Arc<dyn Warehouse>,
        schema: Arc<SchemaDefinition>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            lister,
            resolver: StateResolver::new(warehouse.clone()),
            loader: Loader::new(warehouse.clone(), LoaderSettings::from(config)),
            warehouse,
            namer: Arc::new(LogsDatasetNamer::default()),
            schema,
            options: RunOptions::from(config),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dataset_for(&self, course_id: &str) -> String {
        self.namer.dataset_for(course_id)
    }

    /// Run the pipeline for one course.
    ///
    /// Per-file failures are recorded in the summary. Fatal errors (bad
    /// configuration, enumeration failure, cancellation before loading)
    /// return `Err`. A run stopped by stop-on-error returns a summary in the
    /// `Aborted` state; see [`RunSummary::into_result`].
    #[instrument(skip(self, request), fields(course = %request.course_id))]
    pub async fn run(&self, request: &RunRequest) -> Result<RunSummary> {
        let started_at = Utc::now();
        let (start_date, end_date) =
            resolve_date_range(request.start_date, request.end_date, started_at.date_naive())?;
        let dataset_id = self.dataset_for(&request.course_id);

        info!(
            dataset = %dataset_id,
            %start_date,
            %end_date,
            source = %self.lister.describe(),
            "Starting tracking log run"
        );

        debug!(state = ?RunState::Init, "Ensuring dataset");
        let warehouse = self.warehouse.clone();
        self.options
            .retry
            .run("ensure dataset", &self.cancel, || {
                let warehouse = warehouse.clone();
                let dataset_id = dataset_id.clone();
                async move { warehouse.ensure_dataset(&dataset_id).await }
            })
            .await?;

        debug!(state = ?RunState::Listing, "Listing source files");
        let files = self.list_files(&request.course_id, start_date).await?;

        let mut reports: Vec<Option<FileReport>> = vec![None; files.len()];
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, file) in files.iter().enumerate() {
            match (file.extracted_date, file.target_table_id()) {
                (Some(date), Some(table_id)) if date >= start_date && date <= end_date => {
                    groups.entry(table_id).or_default().push(index)
                },
                (Some(_), Some(_)) => {
                    debug!(file = %file.name, "File outside date range");
                    reports[index] = Some(report(file, None, FileOutcome::OutOfRange));
                },
                _ => {
                    let decision = decide_with(file, None, self.options.freshness);
                    debug!(file = %file.name, "No date in file name, skipping");
                    reports[index] = Some(report(
                        file,
                        Some(decision),
                        FileOutcome::Skipped {
                            reason: DecisionKind::SkipNoDate,
                        },
                    ));
                },
            }
        }

        debug!(state = ?RunState::Resolving, partitions = groups.len(), "Resolving partition tables");
        let resolver = self.resolver.clone();
        let known_tables = self
            .options
            .retry
            .run("list partition tables", &self.cancel, || {
                let resolver = resolver.clone();
                let dataset_id = dataset_id.clone();
                async move { resolver.list_partition_tables(&dataset_id).await }
            })
            .await?;

        let ctx = RunContext {
            dataset_id: &dataset_id,
            known_tables: &known_tables,
            abort: AtomicBool::new(false),
            abort_cause: Mutex::new(None),
        };

        // Under stop-on-error no partition may start loading next to a failing one
        let workers = if self.options.stop_on_error {
            1
        } else {
            self.options.workers
        };
        debug!(state = ?RunState::Loading, workers, "Processing partitions");
        let outcomes: Vec<Vec<(usize, FileReport)>> = stream::iter(groups)
            .map(|(table_id, indexes)| {
                let group: Vec<(usize, &FileDescriptor)> =
                    indexes.into_iter().map(|i| (i, &files[i])).collect();
                let ctx = &ctx;
                async move { self.process_partition(ctx, table_id, group).await }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        for (index, file_report) in outcomes.into_iter().flatten() {
            reports[index] = Some(file_report);
        }

        let files: Vec<FileReport> = reports.into_iter().flatten().collect();
        let mut abort_cause = ctx.abort_cause.lock().ok().and_then(|mut c| c.take());
        let interrupted = files.iter().any(|f| f.outcome.is_interrupted());
        if interrupted && abort_cause.is_none() {
            abort_cause = Some(IngestError::Cancelled.to_string());
        }
        let state = if ctx.aborted() || interrupted {
            RunState::Aborted
        } else {
            RunState::Done
        };

        let summary = RunSummary {
            course_id: request.course_id.clone(),
            dataset_id: dataset_id.clone(),
            state,
            start_date,
            end_date,
            started_at,
            finished_at: Utc::now(),
            files,
            abort_cause,
        };

        let counts = summary.counts();
        match summary.state {
            RunState::Aborted => error!(
                cause = ?summary.abort_cause,
                loaded = counts.loaded,
                failed = counts.failed,
                not_attempted = counts.not_attempted,
                "Run aborted"
            ),
            _ => info!(
                loaded = counts.loaded,
                submitted = counts.submitted,
                skipped = counts.skipped_total(),
                out_of_range = counts.out_of_range,
                failed = counts.failed,
                "Run finished"
            ),
        }

        Ok(summary)
    }

    /// Drain the lister into a list sorted by date then name
    async fn list_files(&self, course_id: &str, start_date: NaiveDate) -> Result<Vec<FileDescriptor>> {
        let enumeration = |e: IngestError| match e {
            IngestError::Cancelled | IngestError::Config(_) | IngestError::Enumeration(_) => e,
            other => IngestError::Enumeration(other.to_string()),
        };

        let mut stream = self
            .lister
            .list(course_id, Some(start_date))
            .await
            .map_err(enumeration)?;

        let mut files = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                next = stream.next() => match next {
                    Some(Ok(file)) => files.push(file),
                    Some(Err(e)) => return Err(enumeration(e)),
                    None => break,
                },
            }
        }

        files.sort_by(|a, b| {
            a.extracted_date
                .cmp(&b.extracted_date)
                .then_with(|| a.name.cmp(&b.name))
        });
        info!(files = files.len(), "Listed source files");
        Ok(files)
    }

    async fn describe_table(&self, ctx: &RunContext<'_>, table_id: &str) -> Result<TableDescriptor> {
        let resolver = self.resolver.clone();
        self.options
            .retry
            .run("describe table", &self.cancel, || {
                let resolver = resolver.clone();
                let dataset_id = ctx.dataset_id.to_string();
                let table_id = table_id.to_string();
                let known = ctx.known_tables.clone();
                async move { resolver.describe(&dataset_id, &table_id, &known).await }
            })
            .await
    }

    /// Decide and load every file of one partition table, in order
    async fn process_partition(
        &self,
        ctx: &RunContext<'_>,
        table_id: String,
        files: Vec<(usize, &FileDescriptor)>,
    ) -> Vec<(usize, FileReport)> {
        let not_attempted = |reason| {
            files
                .iter()
                .map(|(i, f)| (*i, report(f, None, FileOutcome::NotAttempted { reason })))
                .collect::<Vec<_>>()
        };

        if self.cancel.is_cancelled() {
            return not_attempted(NotAttemptedReason::Cancelled);
        }
        if ctx.aborted() {
            return not_attempted(NotAttemptedReason::Aborted);
        }

        let table = match self.describe_table(ctx, &table_id).await {
            Ok(table) => table,
            Err(IngestError::Cancelled) => return not_attempted(NotAttemptedReason::Cancelled),
            Err(e) => {
                warn!(table = %table_id, error = %e, "Could not resolve table state");
                if self.options.stop_on_error || e.is_fatal() {
                    ctx.trip(&e);
                }
                return files
                    .iter()
                    .map(|(i, f)| (*i, report(f, None, FileOutcome::failed(&e))))
                    .collect();
            },
        };

        debug!(state = ?RunState::Deciding, table = %table_id, files = files.len(), "Deciding partition");
        let mut decisions: Vec<LoadDecision> = files
            .iter()
            .map(|(_, f)| decide_with(f, Some(&table), self.options.freshness))
            .collect();

        // A partition with several files is rewritten as a unit
        let rewrite = files.len() > 1 && decisions.iter().any(|d| d.needs_load());
        if rewrite {
            decisions = decisions.iter().map(|d| d.promote_for_rewrite()).collect();
            info!(table = %table_id, files = files.len(), "Rewriting multi-file partition");
        }

        // Every load of a rewrite but the last must finish before the next one starts
        let last_load = decisions.iter().rposition(|d| d.needs_load());

        let mut reports = Vec::with_capacity(files.len());
        let mut first_load = true;
        let mut group_failed = false;

        for (position, ((index, file), decision)) in files.iter().zip(decisions).enumerate() {
            let Some(decided_mode) = decision.load_mode() else {
                debug!(file = %file.name, decision = %decision.kind, "Skipping file");
                let reason = decision.kind;
                reports.push((*index, report(file, Some(decision), FileOutcome::Skipped { reason })));
                continue;
            };

            let blocked = if group_failed {
                Some(NotAttemptedReason::PartitionFailed)
            } else if self.cancel.is_cancelled() {
                Some(NotAttemptedReason::Cancelled)
            } else if ctx.aborted() {
                Some(NotAttemptedReason::Aborted)
            } else {
                None
            };
            if let Some(reason) = blocked {
                reports.push((
                    *index,
                    report(file, Some(decision), FileOutcome::NotAttempted { reason }),
                ));
                continue;
            }

            let mode = match (rewrite, first_load) {
                (true, true) if table.exists() => LoadMode::Replace,
                (true, _) => LoadMode::Append,
                (false, _) => decided_mode,
            };
            first_load = false;
            let wait = self.options.wait || (rewrite && Some(position) != last_load);

            info!(file = %file.name, table = %table_id, decision = %decision.kind, %mode, wait, "Loading file");
            let outcome = match self.load_file(ctx, file, &table_id, mode, wait).await {
                Ok(result) => loaded(mode, result),
                Err(IngestError::Cancelled) => FileOutcome::NotAttempted {
                    reason: NotAttemptedReason::Cancelled,
                },
                Err(e) => {
                    error!(file = %file.name, table = %table_id, error = %e, "Load failed");
                    group_failed = true;
                    if self.options.stop_on_error || e.is_fatal() {
                        ctx.trip(&e);
                    }
                    FileOutcome::failed(&e)
                },
            };
            reports.push((*index, report(file, Some(decision), outcome)));
        }

        reports
    }

    async fn load_file(
        &self,
        ctx: &RunContext<'_>,
        file: &FileDescriptor,
        table_id: &str,
        mode: LoadMode,
        wait: bool,
    ) -> Result<LoadResult> {
        let source = self.lister.fetch(file).await?;
        self.loader
            .load(
                LoadTarget {
                    dataset_id: ctx.dataset_id,
                    table_id,
                    mode,
                },
                self.schema.clone(),
                source,
                wait,
                &self.cancel,
            )
            .await
    }
}
