//! pgs3backup storage - uploads archive streams to an object store
//!
//! [`ObjectStoreSink`] implements the core [`ObjectSink`] contract on top
//! of any `object_store` backend using a streaming multipart upload. The
//! object only becomes visible once the stream finished cleanly; any
//! failure aborts the upload.
//!
//! [`S3Config`] builds the S3 backend used in production.
//!
//! [`ObjectSink`]: pgs3backup_core::ObjectSink

mod s3;
mod sink;

pub use s3::{S3Config, StorageError};
pub use sink::{DEFAULT_MAX_CONCURRENCY, DEFAULT_PART_SIZE, ObjectStoreSink};
