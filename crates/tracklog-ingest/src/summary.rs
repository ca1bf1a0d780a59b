//! Run summary
//!
//! Every listed file ends up in the summary with exactly one outcome.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracklog_common::LoadMode;

use crate::decision::{DecisionKind, LoadDecision};
use crate::error::{IngestError, Result, RowError};

/// States of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Listing,
    Resolving,
    Deciding,
    Loading,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAttemptedReason {
    /// Stop-on-error tripped before this file started
    Aborted,
    Cancelled,
    /// An earlier file of the same partition failed
    PartitionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Loaded {
        mode: LoadMode,
        job_id: String,
        rows_loaded: Option<u64>,
        bad_rows: Vec<RowError>,
        /// False when submitted without waiting for completion
        completed: bool,
    },
    Skipped {
        reason: DecisionKind,
    },
    OutOfRange,
    Failed {
        kind: String,
        cause: String,
    },
    NotAttempted {
        reason: NotAttemptedReason,
    },
}

impl FileOutcome {
    pub fn failed(err: &IngestError) -> Self {
        FileOutcome::Failed {
            kind: err.kind().to_string(),
            cause: err.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. })
    }

    /// Left unfinished by cancellation: never started, or its job state is unknown
    pub fn is_interrupted(&self) -> bool {
        match self {
            FileOutcome::NotAttempted {
                reason: NotAttemptedReason::Cancelled,
            } => true,
            FileOutcome::Failed { kind, .. } => kind == "job_state_unknown",
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub name: String,
    pub size_bytes: u64,
    pub file_date: Option<NaiveDate>,
    pub table_id: Option<String>,
    /// Absent for files never decided (out of range, not attempted)
    pub decision: Option<LoadDecision>,
    pub outcome: FileOutcome,
}

/// Aggregate counts of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub loaded: usize,
    pub submitted: usize,
    pub skipped: BTreeMap<String, usize>,
    pub out_of_range: usize,
    pub failed: usize,
    pub not_attempted: usize,
}

impl RunCounts {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub course_id: String,
    pub dataset_id: String,
    pub state: RunState,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileReport>,
    /// First failure that aborted the run under stop-on-error
    pub abort_cause: Option<String>,
}

impl RunSummary {
    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts::default();
        for file in &self.files {
            match &file.outcome {
                FileOutcome::Loaded { completed: true, .. } => counts.loaded += 1,
                FileOutcome::Loaded { completed: false, .. } => counts.submitted += 1,
                FileOutcome::Skipped { reason } => {
                    *counts.skipped.entry(reason.to_string()).or_default() += 1
                },
                FileOutcome::OutOfRange => counts.out_of_range += 1,
                FileOutcome::Failed { .. } => counts.failed += 1,
                FileOutcome::NotAttempted { .. } => counts.not_attempted += 1,
            }
        }
        counts
    }

    pub fn is_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }

    /// Turn an aborted run into an error, keep the summary otherwise
    pub fn into_result(self) -> Result<Self> {
        if self.state != RunState::Aborted {
            return Ok(self);
        }
        match self.abort_cause {
            Some(cause) => Err(IngestError::Aborted {
                course_id: self.course_id,
                cause,
            }),
            None => Err(IngestError::Cancelled),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.outcome.is_failure())
    }
}
