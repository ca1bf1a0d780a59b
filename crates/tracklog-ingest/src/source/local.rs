//! Local filesystem lister

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use tracklog_common::types::DatePattern;
use tracklog_common::FileDescriptor;

use super::{FileStream, LoadSource, SourceLister};
use crate::error::{IngestError, Result};

/// Lists `<logs_root>/<course_id>/`, one level deep
#[derive(Debug, Clone)]
pub struct LocalLister {
    logs_root: PathBuf,
    allow_missing: bool,
    pattern: DatePattern,
}

impl LocalLister {
    pub fn new(logs_root: impl Into<PathBuf>, pattern: DatePattern) -> Self {
        Self {
            logs_root: logs_root.into(),
            allow_missing: false,
            pattern,
        }
    }

    /// Report a missing course directory as an empty listing instead of an error
    pub fn allow_missing(mut self, allow: bool) -> Self {
        self.allow_missing = allow;
        self
    }

    pub fn course_dir(&self, course_id: &str) -> PathBuf {
        self.logs_root.join(course_id)
    }
}

async fn is_missing(dir: &Path) -> Result<bool> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(IngestError::Enumeration(format!(
            "{} is not a directory",
            dir.display()
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(IngestError::Enumeration(format!(
            "cannot read {}: {}",
            dir.display(),
            e
        ))),
    }
}

#[async_trait]
impl SourceLister for LocalLister {
    /// The whole directory is listed; `start_date` is applied by the caller's
    /// date range so that earlier files are still reported.
    #[instrument(skip(self), fields(root = %self.logs_root.display()))]
    async fn list(&self, course_id: &str, _start_date: Option<NaiveDate>) -> Result<FileStream> {
        let dir = self.course_dir(course_id);

        if is_missing(&dir).await? {
            if self.allow_missing {
                warn!(dir = %dir.display(), "Course log directory does not exist, nothing to load");
                return Ok(stream::empty().boxed());
            }
            return Err(IngestError::Enumeration(format!(
                "course log directory {} does not exist",
                dir.display()
            )));
        }

        let entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            IngestError::Enumeration(format!("cannot list {}: {}", dir.display(), e))
        })?;
        debug!(dir = %dir.display(), "Listing local tracking logs");

        let pattern = self.pattern.clone();
        let files = stream::try_unfold(entries, move |mut entries| {
            let pattern = pattern.clone();
            async move {
                while let Some(entry) = entries.next_entry().await? {
                    let meta = entry.metadata().await?;
                    if !meta.is_file() {
                        continue;
                    }

                    let modified_at: DateTime<Utc> = meta.modified()?.into();
                    let name = entry.path().display().to_string();
                    let file = FileDescriptor::new(name, meta.len(), modified_at, &pattern);
                    return Ok(Some((file, entries)));
                }
                Ok::<_, IngestError>(None)
            }
        });

        Ok(files.boxed())
    }

    async fn fetch(&self, file: &FileDescriptor) -> Result<LoadSource> {
        Ok(LoadSource::Path(PathBuf::from(&file.name)))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.logs_root.display())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn lister(root: &Path) -> LocalLister {
        LocalLister::new(root, DatePattern::default_pattern().unwrap())
    }

    #[tokio::test]
    async fn test_lists_files_flat() {
        let root = tempfile::tempdir().unwrap();
        let course = root.path().join("course1");
        std::fs::create_dir_all(course.join("nested")).unwrap();
        std::fs::write(course.join("log-2019-06-13.gz"), vec![0u8; 100]).unwrap();
        std::fs::write(course.join("notes.txt"), b"x").unwrap();
        std::fs::write(course.join("nested").join("log-2019-06-14.gz"), vec![0u8; 100]).unwrap();

        let mut files: Vec<FileDescriptor> = lister(root.path())
            .list("course1", None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(files.len(), 2);
        assert!(files[0].name.ends_with("log-2019-06-13.gz"));
        assert_eq!(files[0].size_bytes, 100);
        assert_eq!(files[0].target_table_id().as_deref(), Some("tracklog_20190613"));
        assert!(files[1].name.ends_with("notes.txt"));
        assert_eq!(files[1].extracted_date, None);
    }

    #[tokio::test]
    async fn test_missing_dir_is_enumeration_error() {
        let root = tempfile::tempdir().unwrap();
        let err = lister(root.path()).list("nope", None).await.err().unwrap();
        assert!(matches!(err, IngestError::Enumeration(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_dir_tolerated() {
        let root = tempfile::tempdir().unwrap();
        let files: Vec<FileDescriptor> = lister(root.path())
            .allow_missing(true)
            .list("nope", None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_returns_path() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("log-2019-06-13.gz");
        std::fs::write(&path, b"{}\n").unwrap();

        let file = FileDescriptor::new(
            path.display().to_string(),
            3,
            Utc::now(),
            &DatePattern::default_pattern().unwrap(),
        );
        let source = lister(root.path()).fetch(&file).await.unwrap();
        assert_eq!(source, LoadSource::Path(path));
        assert_eq!(source.read().await.unwrap(), b"{}\n".to_vec());
    }
}
