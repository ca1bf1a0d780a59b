//! Object storage lister
//!
//! Tracking logs are laid out as one folder per log-producing server under a
//! common key prefix:
//!
//! ```text
//! <prefix><server>/<file_name_pattern><date>-<suffix>.gz
//! ```
//!
//! Listing first walks the prefix with delimiter `/` to find the server
//! folders, then pages through each folder. Every page is fetched lazily, so
//! dropping the stream stops pagination.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use tracklog_common::types::{DatePattern, DEFAULT_DATE_FORMAT};
use tracklog_common::FileDescriptor;

use super::{FileStream, LoadSource, SourceLister};
use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;

/// Placeholder substituted with the course id in the configured prefix
pub const COURSE_PLACEHOLDER: &str = "{course_id}";

/// One `list_objects` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectsRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub page_token: Option<String>,
    /// Exclusive lower bound on returned keys
    pub start_after: Option<String>,
    pub max_keys: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub entries: Vec<ObjectEntry>,
    /// Folders found when listing with a delimiter
    pub common_prefixes: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Minimal object storage surface used by the lister
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(&self, request: &ListObjectsRequest) -> Result<ObjectPage>;

    async fn download_object(&self, key: &str) -> Result<Vec<u8>>;

    fn bucket(&self) -> &str;
}

#[derive(Clone)]
pub struct RemoteLister {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    file_name_pattern: String,
    date_format: String,
    page_size: i32,
    download_dir: Option<PathBuf>,
    pattern: DatePattern,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RemoteLister {
    /// Create a lister; an empty prefix is a configuration error
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        file_name_pattern: impl Into<String>,
        pattern: DatePattern,
    ) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            return Err(IngestError::Config(
                "remote listing requires a key prefix".to_string(),
            ));
        }

        Ok(Self {
            store,
            prefix,
            file_name_pattern: file_name_pattern.into(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            page_size: 1000,
            download_dir: None,
            pattern,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size.clamp(1, 1000);
        self
    }

    /// Format used to render the start date into a key
    pub fn with_date_format(mut self, format: impl Into<String>) -> Self {
        self.date_format = format.into();
        self
    }

    pub fn with_download_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.download_dir = dir;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn course_prefix(&self, course_id: &str) -> String {
        self.prefix.replace(COURSE_PLACEHOLDER, course_id)
    }

    /// Lazily page through one listing
    fn pages(&self, first: ListObjectsRequest) -> BoxStream<'static, Result<ObjectPage>> {
        let store = self.store.clone();
        let retry = self.retry;
        let cancel = self.cancel.clone();

        stream::try_unfold(Some(first), move |state| {
            let store = store.clone();
            let cancel = cancel.clone();
            async move {
                let Some(request) = state else {
                    return Ok(None);
                };

                let page = retry
                    .run("list objects", &cancel, || {
                        let store = store.clone();
                        let request = request.clone();
                        async move { store.list_objects(&request).await }
                    })
                    .await
                    .map_err(|e| match e {
                        IngestError::Cancelled => e,
                        other => IngestError::Enumeration(format!(
                            "listing '{}' failed: {}",
                            request.prefix, other
                        )),
                    })?;

                debug!(
                    prefix = %request.prefix,
                    objects = page.entries.len(),
                    folders = page.common_prefixes.len(),
                    "Fetched listing page"
                );

                let next = page.next_page_token.clone().map(|token| ListObjectsRequest {
                    page_token: Some(token),
                    ..request
                });
                Ok::<_, IngestError>(Some((page, next)))
            }
        })
        .boxed()
    }

    fn page_files(&self, entries: Vec<ObjectEntry>) -> FileStream {
        let pattern = self.pattern.clone();
        let files: Vec<Result<FileDescriptor>> = entries
            .into_iter()
            .filter(|entry| !entry.key.ends_with('/'))
            .map(|entry| {
                Ok(FileDescriptor::new(
                    entry.key,
                    entry.size,
                    entry.last_modified,
                    &pattern,
                ))
            })
            .collect();
        stream::iter(files).boxed()
    }

    /// Files of one server folder, starting after `start_date` when given
    fn folder_files(&self, folder: String, start_date: Option<NaiveDate>) -> FileStream {
        let prefix = format!("{}{}", folder, self.file_name_pattern);
        let start_after =
            start_date.map(|date| format!("{}{}", prefix, date.format(&self.date_format)));

        let lister = self.clone();
        self.pages(ListObjectsRequest {
            prefix,
            delimiter: None,
            page_token: None,
            start_after,
            max_keys: self.page_size,
        })
        .map_ok(move |page| lister.page_files(page.entries))
        .try_flatten()
        .boxed()
    }
}

/// Local copy of `key` under `dir`, keeping its folders
fn download_path(dir: &Path, key: &str) -> PathBuf {
    key.split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(dir.to_path_buf(), |path, part| path.join(part))
}

#[async_trait]
impl SourceLister for RemoteLister {
    #[instrument(skip(self), fields(bucket = %self.store.bucket()))]
    async fn list(&self, course_id: &str, start_date: Option<NaiveDate>) -> Result<FileStream> {
        let prefix = self.course_prefix(course_id);
        info!(prefix = %prefix, "Listing remote tracking logs");

        let top = self.pages(ListObjectsRequest {
            prefix,
            delimiter: Some("/".to_string()),
            page_token: None,
            start_after: None,
            max_keys: self.page_size,
        });

        let lister = self.clone();
        let files = top
            .map_ok(move |page| {
                let folders = lister.clone();
                let nested = stream::iter(page.common_prefixes)
                    .map(move |folder| folders.folder_files(folder, start_date))
                    .flatten();
                lister.page_files(page.entries).chain(nested).boxed()
            })
            .try_flatten();

        Ok(files.boxed())
    }

    #[instrument(skip(self, file), fields(key = %file.name))]
    async fn fetch(&self, file: &FileDescriptor) -> Result<LoadSource> {
        let store = self.store.clone();
        let key = file.name.clone();
        let bytes = self
            .retry
            .run("download object", &self.cancel, || {
                let store = store.clone();
                let key = key.clone();
                async move { store.download_object(&key).await }
            })
            .await?;

        match &self.download_dir {
            Some(dir) => {
                let path = download_path(dir, &file.name);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &bytes).await?;
                debug!(path = %path.display(), bytes = bytes.len(), "Downloaded object to disk");
                Ok(LoadSource::Path(path))
            },
            None => Ok(LoadSource::Bytes(bytes)),
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.store.bucket(), self.prefix)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Serves fixed pages keyed by (prefix, page token) and records requests
    struct FixedStore {
        pages: Vec<(String, Option<String>, ObjectPage)>,
        requests: Mutex<Vec<ListObjectsRequest>>,
    }

    #[async_trait]
    impl ObjectStore for FixedStore {
        async fn list_objects(&self, request: &ListObjectsRequest) -> Result<ObjectPage> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(self
                .pages
                .iter()
                .find(|(prefix, token, _)| *prefix == request.prefix && *token == request.page_token)
                .map(|(_, _, page)| page.clone())
                .unwrap_or_default())
        }

        async fn download_object(&self, key: &str) -> Result<Vec<u8>> {
            Ok(key.as_bytes().to_vec())
        }

        fn bucket(&self) -> &str {
            "edx-logs"
        }
    }

    fn entry(key: &str) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            size: 1000,
            last_modified: Utc.with_ymd_and_hms(2019, 6, 14, 0, 0, 0).unwrap(),
        }
    }

    fn remote(store: Arc<FixedStore>) -> RemoteLister {
        RemoteLister::new(
            store,
            "logs/",
            "tracking.log-",
            DatePattern::default_pattern().unwrap(),
        )
        .unwrap()
        .with_retry(RetryPolicy::none())
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let store = Arc::new(FixedStore {
            pages: vec![],
            requests: Mutex::new(vec![]),
        });
        let result = RemoteLister::new(store, " ", "tracking.log-", DatePattern::default_pattern().unwrap());
        assert!(matches!(result, Err(IngestError::Config(_))));
    }

    #[tokio::test]
    async fn test_walks_folders_and_pages() {
        let store = Arc::new(FixedStore {
            pages: vec![
                (
                    "logs/".into(),
                    None,
                    ObjectPage {
                        entries: vec![entry("logs/"), entry("logs/tracking.log-2019-06-10.gz")],
                        common_prefixes: vec!["logs/srv1/".into(), "logs/srv2/".into()],
                        next_page_token: None,
                    },
                ),
                (
                    "logs/srv1/tracking.log-".into(),
                    None,
                    ObjectPage {
                        entries: vec![entry("logs/srv1/tracking.log-2019-06-13-1.gz")],
                        common_prefixes: vec![],
                        next_page_token: Some("p2".into()),
                    },
                ),
                (
                    "logs/srv1/tracking.log-".into(),
                    Some("p2".into()),
                    ObjectPage {
                        entries: vec![entry("logs/srv1/tracking.log-2019-06-14-1.gz")],
                        common_prefixes: vec![],
                        next_page_token: None,
                    },
                ),
                (
                    "logs/srv2/tracking.log-".into(),
                    None,
                    ObjectPage {
                        entries: vec![entry("logs/srv2/tracking.log-2019-06-13-2.gz")],
                        common_prefixes: vec![],
                        next_page_token: None,
                    },
                ),
            ],
            requests: Mutex::new(vec![]),
        });

        let start = NaiveDate::from_ymd_opt(2019, 6, 12).unwrap();
        let files: Vec<FileDescriptor> = remote(store.clone())
            .list("MITx/6.002x/2013_Spring", Some(start))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "logs/tracking.log-2019-06-10.gz",
                "logs/srv1/tracking.log-2019-06-13-1.gz",
                "logs/srv1/tracking.log-2019-06-14-1.gz",
                "logs/srv2/tracking.log-2019-06-13-2.gz",
            ]
        );

        let requests = store.requests.lock().unwrap();
        assert_eq!(requests[0].delimiter.as_deref(), Some("/"));
        let srv1 = requests
            .iter()
            .find(|r| r.prefix == "logs/srv1/tracking.log-")
            .unwrap();
        assert_eq!(
            srv1.start_after.as_deref(),
            Some("logs/srv1/tracking.log-2019-06-12")
        );
    }

    #[tokio::test]
    async fn test_course_placeholder() {
        let store = Arc::new(FixedStore {
            pages: vec![],
            requests: Mutex::new(vec![]),
        });
        let lister = RemoteLister::new(
            store.clone(),
            "{course_id}/logs/",
            "tracking.log-",
            DatePattern::default_pattern().unwrap(),
        )
        .unwrap();

        let files: Vec<FileDescriptor> =
            lister.list("edX", None).await.unwrap().try_collect().await.unwrap();
        assert!(files.is_empty());
        assert_eq!(store.requests.lock().unwrap()[0].prefix, "edX/logs/");
    }

    #[tokio::test]
    async fn test_fetch_into_download_dir() {
        let store = Arc::new(FixedStore {
            pages: vec![],
            requests: Mutex::new(vec![]),
        });
        let dir = tempfile::tempdir().unwrap();
        let lister = remote(store).with_download_dir(Some(dir.path().to_path_buf()));

        let file = FileDescriptor::new(
            "logs/srv1/tracking.log-2019-06-13-1.gz",
            1000,
            Utc::now(),
            &DatePattern::default_pattern().unwrap(),
        );
        let source = lister.fetch(&file).await.unwrap();
        let expected = dir.path().join("logs/srv1/tracking.log-2019-06-13-1.gz");
        assert_eq!(source, LoadSource::Path(expected.clone()));
        assert_eq!(
            std::fs::read(expected).unwrap(),
            b"logs/srv1/tracking.log-2019-06-13-1.gz".to_vec()
        );
    }

    #[tokio::test]
    async fn test_same_name_in_two_folders_kept_apart() {
        let store = Arc::new(FixedStore {
            pages: vec![],
            requests: Mutex::new(vec![]),
        });
        let dir = tempfile::tempdir().unwrap();
        let lister = remote(store).with_download_dir(Some(dir.path().to_path_buf()));
        let pattern = DatePattern::default_pattern().unwrap();

        let first = FileDescriptor::new("logs/srv1/tracking.log-2019-06-13.gz", 1000, Utc::now(), &pattern);
        let second = FileDescriptor::new("logs/srv2/tracking.log-2019-06-13.gz", 1000, Utc::now(), &pattern);
        let first_source = lister.fetch(&first).await.unwrap();
        let second_source = lister.fetch(&second).await.unwrap();

        assert_ne!(first_source, second_source);
        assert_eq!(first_source.read().await.unwrap(), first.name.as_bytes());
        assert_eq!(second_source.read().await.unwrap(), second.name.as_bytes());
    }

    #[test]
    fn test_download_path_stays_inside_dir() {
        let dir = Path::new("/tmp/tracklog");
        assert_eq!(
            download_path(dir, "/logs//../srv1/./tracking.log-2019-06-13.gz"),
            dir.join("logs/srv1/tracking.log-2019-06-13.gz")
        );
    }
}
