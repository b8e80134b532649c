//! Streaming multipart sink
//!
//! The byte stream is cut into parts of at least `part_size` bytes, with up
//! to `max_concurrency` part uploads in flight. Any failure, from the stream
//! or from the store, aborts the multipart upload so no object appears.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use object_store::path::Path;
use object_store::{MultipartUpload, ObjectStore, PutPayloadMut, UploadPart};
use pgs3backup_core::{ByteStream, DumpError, ObjectSink, Result, UploadReceipt, UploadTarget};

/// Smallest part size S3 accepts for every part but the last
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

/// Parts uploaded concurrently before the sink stops pulling from the stream
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub(crate) fn sink_error(e: object_store::Error) -> DumpError {
    DumpError::Sink(e.to_string())
}

/// Stores each backup stream as one object via multipart upload
#[derive(Debug)]
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    location_base: String,
    part_size: usize,
    max_concurrency: usize,
}

impl ObjectStoreSink {
    /// `location_base` is joined with the object key to form the location
    /// reported after a successful upload.
    pub fn new(store: Arc<dyn ObjectStore>, location_base: impl Into<String>) -> Self {
        Self {
            store,
            location_base: location_base.into().trim_end_matches('/').to_string(),
            part_size: DEFAULT_PART_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn location(&self, key: &str) -> String {
        format!("{}/{}", self.location_base, key)
    }

    /// Upload every part of `body` and wait for all of them to land
    async fn write_parts(
        &self,
        upload: &mut dyn MultipartUpload,
        body: &mut ByteStream,
    ) -> Result<(u64, usize)> {
        let mut in_flight: FuturesUnordered<UploadPart> = FuturesUnordered::new();
        let mut part = PutPayloadMut::new();
        let mut bytes = 0u64;
        let mut parts = 0usize;

        loop {
            let chunk = body.next().await.transpose()?;
            let last = chunk.is_none();
            if let Some(chunk) = chunk {
                bytes += chunk.len() as u64;
                part.push(chunk);
            }

            let full = part.content_length() >= self.part_size;
            // The object needs at least one part, even when empty.
            if full || (last && (part.content_length() > 0 || parts == 0)) {
                while in_flight.len() >= self.max_concurrency {
                    if let Some(done) = in_flight.next().await {
                        done.map_err(sink_error)?;
                    }
                }
                let payload = std::mem::replace(&mut part, PutPayloadMut::new()).freeze();
                in_flight.push(upload.put_part(payload));
                parts += 1;
            }

            if last {
                break;
            }
        }

        while let Some(done) = in_flight.next().await {
            done.map_err(sink_error)?;
        }
        Ok((bytes, parts))
    }
}

#[async_trait]
impl ObjectSink for ObjectStoreSink {
    async fn upload(&self, target: &UploadTarget, mut body: ByteStream) -> Result<UploadReceipt> {
        let key = target.object_key();
        let path = Path::from(key.as_str());

        let mut upload = self.store.put_multipart(&path).await.map_err(sink_error)?;

        let outcome = match self.write_parts(upload.as_mut(), &mut body).await {
            Ok((bytes, parts)) => match upload.complete().await {
                Ok(_) => Ok((bytes, parts)),
                Err(e) => Err(sink_error(e)),
            },
            Err(e) => Err(e),
        };

        let (bytes, parts) = match outcome {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "aborting multipart upload");
                if let Err(abort_err) = upload.abort().await {
                    tracing::warn!(key = %key, error = %abort_err, "failed to abort multipart upload");
                }
                return Err(e);
            }
        };

        let location = self.location(&key);
        tracing::info!(location = %location, bytes, parts, "upload complete");
        Ok(UploadReceipt {
            key,
            location,
            bytes,
        })
    }
}
