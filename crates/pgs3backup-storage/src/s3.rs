//! S3 backend configuration

use std::fmt;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use pgs3backup_core::DumpError;
use thiserror::Error;

use crate::sink::ObjectStoreSink;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid storage configuration: {0}")]
    Config(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl From<StorageError> for DumpError {
    fn from(err: StorageError) -> Self {
        DumpError::Sink(err.to_string())
    }
}

/// Connection settings for an S3 or S3-compatible bucket
#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for S3-compatible stores. Implies path-style
    /// addressing and allows plain http.
    pub endpoint: Option<String>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl S3Config {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/'))
            .filter(|e| !e.is_empty())
    }

    /// Prefix of every reported object location.
    ///
    /// `<endpoint>/<bucket>` for custom endpoints, otherwise the AWS
    /// virtual-hosted bucket URL.
    pub fn location_base(&self) -> String {
        match self.endpoint() {
            Some(endpoint) => format!("{}/{}", endpoint, self.bucket),
            None => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    /// Build the S3 client. No request is made until the first upload.
    pub fn build(&self) -> Result<ObjectStoreSink, StorageError> {
        if self.bucket.is_empty() {
            return Err(StorageError::Config("bucket name is empty".to_string()));
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region)
            .with_access_key_id(&self.access_key_id)
            .with_secret_access_key(&self.secret_access_key);

        if let Some(endpoint) = self.endpoint() {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build()?;
        tracing::debug!(bucket = %self.bucket, region = %self.region, endpoint = ?self.endpoint(), "configured S3 store");
        Ok(ObjectStoreSink::new(Arc::new(store), self.location_base()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> S3Config {
        S3Config::new("nightly", "eu-west-1", "AKIAEXAMPLE", "very-secret")
    }

    #[test]
    fn test_aws_location() {
        let sink = config().build().unwrap();
        assert_eq!(
            sink.location("backups/shop.dump.gz"),
            "https://nightly.s3.eu-west-1.amazonaws.com/backups/shop.dump.gz"
        );
    }

    #[test]
    fn test_custom_endpoint_location() {
        let config = config().with_endpoint("http://localhost:9000/");
        assert_eq!(config.location_base(), "http://localhost:9000/nightly");
        let sink = config.build().unwrap();
        assert_eq!(
            sink.location("backups/shop.dump"),
            "http://localhost:9000/nightly/backups/shop.dump"
        );
    }

    #[test]
    fn test_empty_endpoint_is_ignored() {
        let config = config().with_endpoint("");
        assert_eq!(
            config.location_base(),
            "https://nightly.s3.eu-west-1.amazonaws.com"
        );
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let mut config = config();
        config.bucket.clear();
        let err = config.build().unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert!(matches!(DumpError::from(err), DumpError::Sink(_)));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("AKIAEXAMPLE"));
        assert!(rendered.contains("nightly"));
    }
}
