//! Source listers
//!
//! A lister enumerates the candidate tracking log files of one course as a
//! lazy stream of [`FileDescriptor`]s and hands out the bytes of a file when
//! it is loaded. Local directories and object storage sit behind the same
//! trait so the orchestrator never knows which one it drives.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;
use std::path::PathBuf;
use tracklog_common::FileDescriptor;

use crate::error::Result;

pub mod local;
pub mod remote;
pub mod s3;

pub use local::LocalLister;
pub use remote::{ListObjectsRequest, ObjectEntry, ObjectPage, ObjectStore, RemoteLister};
pub use s3::S3ObjectStore;

/// Stream of listed files; dropping it stops enumeration
pub type FileStream = BoxStream<'static, Result<FileDescriptor>>;

/// File contents handed to the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl LoadSource {
    pub async fn read(&self) -> Result<Vec<u8>> {
        match self {
            LoadSource::Path(path) => Ok(tokio::fs::read(path).await?),
            LoadSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            LoadSource::Path(path) => path.display().to_string(),
            LoadSource::Bytes(bytes) => format!("<{} bytes in memory>", bytes.len()),
        }
    }
}

#[async_trait]
pub trait SourceLister: Send + Sync {
    /// Enumerate the files of `course_id`, optionally skipping keys that sort
    /// before `start_date`. Calling it again re-enumerates from scratch.
    async fn list(&self, course_id: &str, start_date: Option<NaiveDate>) -> Result<FileStream>;

    /// Make the contents of a listed file available to the loader
    async fn fetch(&self, file: &FileDescriptor) -> Result<LoadSource>;

    /// Human readable source location for logs
    fn describe(&self) -> String;
}
