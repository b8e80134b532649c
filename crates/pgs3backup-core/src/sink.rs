//! Object-store sink contract

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::Result;

/// The byte stream handed to a sink.
///
/// The stream ends with `None` only after a clean finish. A producer-side
/// failure arrives as a final `Err` item.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Where and under which name a backup is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Destination name prefix, without leading or trailing `/`
    pub prefix: String,
    /// Logical name of the backup, usually the database name
    pub name: String,
    /// Whether the stream is gzip-compressed
    pub compressed: bool,
    /// Timestamp embedded in the object key
    pub timestamp: DateTime<Utc>,
}

impl UploadTarget {
    pub fn new(
        prefix: impl Into<String>,
        name: impl Into<String>,
        compressed: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            compressed,
            timestamp,
        }
    }

    /// `<prefix>/<name>_<YYYY-MM-DD_HH-MM-SS>.dump[.gz]`
    pub fn object_key(&self) -> String {
        let file_name = format!(
            "{}_{}.dump{}",
            self.name,
            self.timestamp.format("%Y-%m-%d_%H-%M-%S"),
            if self.compressed { ".gz" } else { "" }
        );
        if self.prefix.is_empty() {
            file_name
        } else {
            format!("{}/{}", self.prefix, file_name)
        }
    }
}

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Object key the backup was stored under
    pub key: String,
    /// Location identifier reported back to the operator
    pub location: String,
    /// Number of bytes uploaded
    pub bytes: u64,
}

/// Consumes a byte stream and stores it as a single object.
///
/// Uploads are all-or-nothing: when the stream fails, or the sink itself
/// fails, no object may be left behind. An error item received from the
/// stream must be returned unchanged so the caller sees the original cause.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    async fn upload(&self, target: &UploadTarget, body: ByteStream) -> Result<UploadReceipt>;
}
