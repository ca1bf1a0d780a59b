//! Common types used across tracklog
//!
//! A tracking log file is attributed to a calendar day by matching a date
//! pattern against its base name. Every day maps to exactly one partition
//! table named `tracklog_YYYYMMDD`.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracklogError};

/// Prefix shared by every partition table
pub const PARTITION_TABLE_PREFIX: &str = "tracklog_";

/// Default regex used to find a date in a log file name
pub const DEFAULT_DATE_REGEX: &str = r"(\d{4}-\d{2}-\d{2})";

/// Default chrono format of the captured date
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Build the partition table id for a calendar day.
///
/// ```
/// use chrono::NaiveDate;
/// use tracklog_common::types::partition_table_id;
///
/// let date = NaiveDate::from_ymd_opt(2019, 6, 13).unwrap();
/// assert_eq!(partition_table_id(date), "tracklog_20190613");
/// ```
pub fn partition_table_id(date: NaiveDate) -> String {
    format!("{}{}", PARTITION_TABLE_PREFIX, date.format("%Y%m%d"))
}

fn is_path_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Recover the calendar day from a partition table id, if it is one
pub fn parse_partition_table_id(table_id: &str) -> Option<NaiveDate> {
    let digits = table_id.strip_prefix(PARTITION_TABLE_PREFIX)?;
    if digits.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// Date pattern used to attribute a file to a partition
#[derive(Debug, Clone)]
pub struct DatePattern {
    regex: Regex,
    format: String,
}

impl DatePattern {
    /// Compile a pattern. The first capture group (or the whole match when
    /// there is none) must parse with `format`.
    pub fn new(pattern: &str, format: impl Into<String>) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| TracklogError::InvalidDatePattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let format = format.into();
        if format.is_empty() {
            return Err(TracklogError::InvalidDatePattern {
                pattern: pattern.to_string(),
                reason: "date format cannot be empty".to_string(),
            });
        }
        Ok(Self { regex, format })
    }

    /// `YYYY-MM-DD` anywhere in the file name
    pub fn default_pattern() -> Result<Self> {
        Self::new(DEFAULT_DATE_REGEX, DEFAULT_DATE_FORMAT)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Extract the date from a path or object key.
    ///
    /// Only the base name is searched, and the last parseable match wins, so
    /// dated directories and prefixes never leak into the attribution.
    pub fn extract(&self, name: &str) -> Option<NaiveDate> {
        let base = name.rsplit(is_path_separator).next().unwrap_or(name);

        self.regex
            .captures_iter(base)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
            .filter_map(|m| NaiveDate::parse_from_str(m.as_str(), &self.format).ok())
            .last()
    }
}

/// A candidate source file, as reported by a lister
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Local path or object key
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    /// Day the file belongs to; `None` means it cannot be loaded
    pub extracted_date: Option<NaiveDate>,
}

impl FileDescriptor {
    /// Build a descriptor from raw storage metadata
    pub fn new(
        name: impl Into<String>,
        size_bytes: u64,
        modified_at: DateTime<Utc>,
        pattern: &DatePattern,
    ) -> Self {
        let name = name.into();
        let extracted_date = pattern.extract(&name);
        Self {
            name,
            size_bytes,
            modified_at,
            extracted_date,
        }
    }

    /// Partition table this file belongs to
    pub fn target_table_id(&self) -> Option<String> {
        self.extracted_date.map(partition_table_id)
    }
}

/// Warehouse state of one partition table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub dataset_id: String,
    pub table_id: String,
    /// `None` when the table does not exist yet
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl TableDescriptor {
    pub fn new(
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
        last_modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
            last_modified_at,
        }
    }

    pub fn exists(&self) -> bool {
        self.last_modified_at.is_some()
    }
}

/// How a load job writes into its partition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Add rows, creating the table if needed
    Append,
    /// Overwrite the partition contents
    Replace,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Append => "append",
            LoadMode::Replace => "replace",
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
