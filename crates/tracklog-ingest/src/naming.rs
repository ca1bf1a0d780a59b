//! Course id to dataset id normalization

/// Maps a course (tenant) id to the warehouse dataset holding its logs
pub trait DatasetNamer: Send + Sync {
    fn dataset_for(&self, course_id: &str) -> String;
}

/// Default naming: `MITx/6.002x/2013_Spring` becomes `MITx__6_002x__2013_Spring_logs`
#[derive(Debug, Clone)]
pub struct LogsDatasetNamer {
    suffix: String,
}

impl LogsDatasetNamer {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Default for LogsDatasetNamer {
    fn default() -> Self {
        Self::new("_logs")
    }
}

impl DatasetNamer for LogsDatasetNamer {
    fn dataset_for(&self, course_id: &str) -> String {
        let mut dataset: String = course_id
            .trim()
            .replace('/', "__")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        dataset.push_str(&self.suffix);
        dataset
    }
}
