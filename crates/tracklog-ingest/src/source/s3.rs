use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata},
    Client,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use super::remote::{ListObjectsRequest, ObjectEntry, ObjectPage, ObjectStore};
use crate::config::S3Config;
use crate::error::{IngestError, Result};

/// [`ObjectStore`] backed by an S3 bucket
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from static credentials when configured, otherwise from
    /// the default AWS provider chain
    pub async fn new(config: &S3Config) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| IngestError::Config("S3_BUCKET is not set".to_string()))?;

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "tracklog-static");
                aws_sdk_s3::Config::builder()
                    .behavior_version_latest()
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %bucket, "S3 client initialized");

        Ok(Self { client, bucket })
    }
}

/// S3 error codes that no retry can fix
const PERMANENT_CODES: &[&str] = &[
    "NoSuchKey",
    "NoSuchBucket",
    "AccessDenied",
    "AllAccessDisabled",
    "InvalidAccessKeyId",
    "InvalidBucketName",
    "SignatureDoesNotMatch",
];

fn to_chrono(value: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

fn classify(operation: &str, code: Option<&str>, detail: String) -> IngestError {
    match code {
        Some(code) if PERMANENT_CODES.contains(&code) => IngestError::Storage {
            code: code.to_string(),
            message: format!("S3 {} failed: {}", operation, detail),
        },
        _ => IngestError::Transient(format!("S3 {} failed: {}", operation, detail)),
    }
}

fn s3_error<E>(operation: &str, err: E) -> IngestError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let code = err.code().map(str::to_string);
    classify(operation, code.as_deref(), DisplayErrorContext(err).to_string())
}

fn object_entry(obj: &aws_sdk_s3::types::Object) -> Option<Result<ObjectEntry>> {
    let key = obj.key()?;
    let last_modified = obj.last_modified().and_then(to_chrono).ok_or_else(|| {
        IngestError::Enumeration(format!("object {} has no last modified time", key))
    });
    Some(last_modified.map(|last_modified| ObjectEntry {
        key: key.to_string(),
        size: obj.size().unwrap_or(0).max(0) as u64,
        last_modified,
    }))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list_objects(&self, request: &ListObjectsRequest) -> Result<ObjectPage> {
        let mut call = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&request.prefix)
            .max_keys(request.max_keys);

        if let Some(delimiter) = &request.delimiter {
            call = call.delimiter(delimiter);
        }
        if let Some(token) = &request.page_token {
            call = call.continuation_token(token);
        }
        if let Some(start_after) = &request.start_after {
            call = call.start_after(start_after);
        }

        let response = call
            .send()
            .await
            .map_err(|e| s3_error("list_objects_v2", e))?;

        let entries = response
            .contents()
            .iter()
            .filter_map(object_entry)
            .collect::<Result<Vec<_>>>()?;

        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(|s| s.to_string()))
            .collect();

        let next_page_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(|s| s.to_string())
        } else {
            None
        };

        Ok(ObjectPage {
            entries,
            common_prefixes,
            next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn download_object(&self, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error("get_object", e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| classify("read body", None, e.to_string()))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_560_470_401);
        assert_eq!(to_chrono(&dt).unwrap().timestamp(), 1_560_470_401);
    }

    #[test]
    fn test_object_without_timestamp_is_rejected() {
        let dated = aws_sdk_s3::types::Object::builder()
            .key("logs/srv1/tracking.log-2019-06-13.gz")
            .size(1000)
            .last_modified(aws_sdk_s3::primitives::DateTime::from_secs(1_560_470_401))
            .build();
        let entry = object_entry(&dated).unwrap().unwrap();
        assert_eq!(entry.key, "logs/srv1/tracking.log-2019-06-13.gz");
        assert_eq!(entry.size, 1000);
        assert_eq!(entry.last_modified.timestamp(), 1_560_470_401);

        let undated = aws_sdk_s3::types::Object::builder()
            .key("logs/srv1/tracking.log-2019-06-14.gz")
            .size(1000)
            .build();
        let err = object_entry(&undated).unwrap().unwrap_err();
        assert!(matches!(err, IngestError::Enumeration(_)));

        let keyless = aws_sdk_s3::types::Object::builder().size(1).build();
        assert!(object_entry(&keyless).is_none());
    }

    #[test]
    fn test_error_codes_are_classified() {
        for code in ["NoSuchKey", "AccessDenied", "NoSuchBucket", "SignatureDoesNotMatch"] {
            let err = classify("get_object", Some(code), "denied".into());
            assert!(!err.is_transient(), "{} should not be retried", code);
            assert!(!err.is_fatal());
            assert_eq!(err.kind(), "storage");
        }

        for code in [Some("SlowDown"), Some("InternalError"), Some("RequestTimeout"), None] {
            assert!(classify("list_objects_v2", code, "busy".into()).is_transient());
        }
    }

    #[tokio::test]
    async fn test_new_requires_bucket() {
        let config = S3Config::default();
        let result = S3ObjectStore::new(&config).await;
        assert!(matches!(result, Err(IngestError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_with_static_credentials() {
        let config = S3Config {
            bucket: Some("edx-logs".into()),
            endpoint: Some("http://localhost:9000".into()),
            access_key: Some("minio".into()),
            secret_key: Some("minio123".into()),
            path_style: true,
            ..S3Config::default()
        };
        let store = S3ObjectStore::new(&config).await.unwrap();
        assert_eq!(store.bucket(), "edx-logs");
    }
}
