//! Load decision engine
//!
//! Maps a source file and the warehouse state of its partition table to a
//! decision. Everything here is synchronous and free of side effects.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracklog_common::{FileDescriptor, LoadMode, TableDescriptor};

/// Files at or below this size are empty gzip containers
pub const EMPTY_FILE_THRESHOLD: u64 = 45;

/// Outcome of the decision for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Table absent, load into a new table
    Load,
    SkipEmpty,
    SkipUpToDate,
    SkipNoDate,
    /// Table exists but is not strictly newer than the file
    Reload,
}

impl DecisionKind {
    pub fn needs_load(self) -> bool {
        matches!(self, DecisionKind::Load | DecisionKind::Reload)
    }

    /// Write mode for decisions that load; a reload never appends
    pub fn load_mode(self) -> Option<LoadMode> {
        match self {
            DecisionKind::Load => Some(LoadMode::Append),
            DecisionKind::Reload => Some(LoadMode::Replace),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Load => "load",
            DecisionKind::SkipEmpty => "skip_empty",
            DecisionKind::SkipUpToDate => "skip_up_to_date",
            DecisionKind::SkipNoDate => "skip_no_date",
            DecisionKind::Reload => "reload",
        }
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an existing table is compared against the file timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreshnessCheck {
    #[default]
    Enabled,
    /// Any existing table is trusted as up to date
    Disabled,
}

impl From<bool> for FreshnessCheck {
    fn from(check_dates: bool) -> Self {
        if check_dates {
            FreshnessCheck::Enabled
        } else {
            FreshnessCheck::Disabled
        }
    }
}

/// A decision together with the inputs that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadDecision {
    pub kind: DecisionKind,
    pub table_id: Option<String>,
    pub file_size: u64,
    pub file_date: Option<NaiveDate>,
    pub file_modified_at: DateTime<Utc>,
    pub table_modified_at: Option<DateTime<Utc>>,
}

impl LoadDecision {
    pub fn needs_load(&self) -> bool {
        self.kind.needs_load()
    }

    pub fn load_mode(&self) -> Option<LoadMode> {
        self.kind.load_mode()
    }

    /// Turn a skipped-but-loadable file into a load.
    ///
    /// Used when another file of the same partition forces the partition to
    /// be rewritten. Undated and empty files stay skipped.
    pub fn promote_for_rewrite(&self) -> Self {
        let kind = match self.kind {
            DecisionKind::SkipUpToDate => DecisionKind::Reload,
            other => other,
        };
        Self {
            kind,
            ..self.clone()
        }
    }
}

/// Decide with the freshness check enabled
pub fn decide(file: &FileDescriptor, table: Option<&TableDescriptor>) -> LoadDecision {
    decide_with(file, table, FreshnessCheck::Enabled)
}

/// Decide what to do with `file` given the state of its partition table.
///
/// `table` is the descriptor returned by the state resolver; a descriptor for
/// a different table id is treated as absent.
pub fn decide_with(
    file: &FileDescriptor,
    table: Option<&TableDescriptor>,
    freshness: FreshnessCheck,
) -> LoadDecision {
    let table_id = file.target_table_id();
    let table_modified_at = match (&table_id, table) {
        (Some(id), Some(t)) if &t.table_id == id => t.last_modified_at,
        _ => None,
    };

    let kind = match (file.extracted_date, table_modified_at) {
        (None, _) => DecisionKind::SkipNoDate,
        _ if file.size_bytes <= EMPTY_FILE_THRESHOLD => DecisionKind::SkipEmpty,
        (Some(_), None) => DecisionKind::Load,
        (Some(_), Some(_)) if freshness == FreshnessCheck::Disabled => DecisionKind::SkipUpToDate,
        (Some(_), Some(table_mtime)) if table_mtime > file.modified_at => {
            DecisionKind::SkipUpToDate
        },
        (Some(_), Some(_)) => DecisionKind::Reload,
    };

    LoadDecision {
        kind,
        table_id,
        file_size: file.size_bytes,
        file_date: file.extracted_date,
        file_modified_at: file.modified_at,
        table_modified_at,
    }
}
