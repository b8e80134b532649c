//! Export pipeline coordinator
//!
//! One export runs as up to three concurrent pieces:
//!
//! - the producer task: connect, discover tables, write the schema entry
//!   and then one data entry per table into the archive pipe
//! - the optional gzip task between the archive pipe and the upload pipe
//! - the sink upload, driven by the caller
//!
//! The first failure terminates the byte stream the sink sees. A sink
//! failure closes the stream from the other end and cancels the shared
//! query context, so a producer blocked on the database unwinds too. Every
//! task is joined before [`BackupPipeline::run`] returns.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::Compression;
use pgs3backup_core::{
    Connection, Connector, DumpError, ObjectSink, QueryContext, Result, UploadTarget,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveWriter;
use crate::compress::gzip_stage;
use crate::extractor::{SCHEMA_ENTRY_NAME, TableExtractor};
use crate::pipe::pipe;

/// Tuning for one export run
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Gzip the archive before upload
    pub compress: bool,
    /// Gzip level, 0-9
    pub compression_level: u32,
    /// Chunks in flight per pipe
    pub pipe_capacity: usize,
    /// Largest chunk an entry body is split into
    pub chunk_size: usize,
    /// Deadline shared by every database operation and the upload
    pub timeout: Duration,
    /// Export start time, stamped on archive entries
    pub started_at: DateTime<Utc>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            compress: true,
            compression_level: Compression::default().level(),
            pipe_capacity: 16,
            chunk_size: 64 * 1024,
            timeout: Duration::from_secs(300),
            started_at: Utc::now(),
        }
    }
}

/// Summary of a successful export
#[derive(Debug, Clone, PartialEq)]
pub struct BackupReport {
    pub location: String,
    pub key: String,
    pub tables: usize,
    pub rows: u64,
    /// Uncompressed archive size
    pub archive_bytes: u64,
    /// Bytes stored in the object store
    pub uploaded_bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
struct ArchiveSummary {
    tables: usize,
    rows: u64,
    bytes: u64,
}

/// Streams a database export into an object sink
pub struct BackupPipeline {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn ObjectSink>,
    options: BackupOptions,
    shutdown: Option<CancellationToken>,
}

impl BackupPipeline {
    pub fn new(
        connector: Arc<dyn Connector>,
        sink: Arc<dyn ObjectSink>,
        options: BackupOptions,
    ) -> Self {
        Self {
            connector,
            sink,
            options,
            shutdown: None,
        }
    }

    /// Abort the run when `token` is cancelled, e.g. on a shutdown signal
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Run one export and upload it to `target`
    pub async fn run(&self, target: &UploadTarget) -> Result<BackupReport> {
        let started = tokio::time::Instant::now();
        let cancel = match &self.shutdown {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let ctx = QueryContext::with_deadline(
            tokio::time::Instant::now() + self.options.timeout,
            cancel,
        );
        let key = target.object_key();
        tracing::info!(key = %key, compress = self.options.compress, "starting backup");

        let (archive_tx, archive_rx) = pipe(self.options.pipe_capacity);
        let archive = ArchiveWriter::new(
            archive_tx,
            self.options.chunk_size,
            self.options.started_at,
        );
        let producer = tokio::spawn(produce_archive(
            Arc::clone(&self.connector),
            ctx.clone(),
            archive,
        ));

        let (body, compressor) = if self.options.compress {
            let (gzip_tx, gzip_rx) = pipe(self.options.pipe_capacity);
            let level = Compression::new(self.options.compression_level.min(9));
            let task = tokio::spawn(gzip_stage(archive_rx, gzip_tx, level));
            (gzip_rx, Some(task))
        } else {
            (archive_rx, None)
        };

        let upload = ctx.run("upload", self.sink.upload(target, Box::pin(body))).await;
        if let Err(e) = &upload {
            tracing::debug!(error = %e, "upload did not complete, cancelling producer");
            ctx.cancel();
        }

        let produced = join("producer", producer).await;
        let compressed = match compressor {
            Some(task) => Some(join("compressor", task).await),
            None => None,
        };

        let failures: Vec<DumpError> = [
            upload.as_ref().err().cloned(),
            produced.as_ref().err().cloned(),
            compressed.and_then(|outcome| outcome.err()),
        ]
        .into_iter()
        .flatten()
        .collect();

        if let Some(err) = first_failure(failures) {
            tracing::error!(stage = %err.stage(), error = %err, "backup failed");
            return Err(err);
        }

        let (Ok(receipt), Ok(summary)) = (upload, produced) else {
            return Err(DumpError::Cancelled("pipeline ended without a result".to_string()));
        };

        let report = BackupReport {
            location: receipt.location,
            key: receipt.key,
            tables: summary.tables,
            rows: summary.rows,
            archive_bytes: summary.bytes,
            uploaded_bytes: receipt.bytes,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            location = %report.location,
            tables = report.tables,
            rows = report.rows,
            archive_bytes = report.archive_bytes,
            uploaded_bytes = report.uploaded_bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "backup complete"
        );
        Ok(report)
    }
}

/// The root cause among stage failures: the first one that is not merely
/// a report of the other side going away.
fn first_failure(failures: Vec<DumpError>) -> Option<DumpError> {
    let position = failures
        .iter()
        .position(|e| !e.is_cancellation())
        .unwrap_or(0);
    failures.into_iter().nth(position)
}

async fn join<T>(task: &str, handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => Err(DumpError::Cancelled(format!("{} task aborted: {}", task, e))),
    }
}

async fn produce_archive(
    connector: Arc<dyn Connector>,
    ctx: QueryContext,
    mut archive: ArchiveWriter,
) -> Result<ArchiveSummary> {
    let mut connection = match connector.connect(&ctx).await {
        Ok(connection) => connection,
        Err(e) => {
            archive.fail(e.clone()).await;
            return Err(e);
        }
    };

    let outcome = write_entries(connection.as_ref(), &ctx, &mut archive).await;

    if let Err(e) = connection.close().await {
        tracing::warn!(error = %e, "failed to close database connection");
    }

    match outcome {
        Ok((tables, rows)) => {
            let bytes = archive.finish().await?;
            Ok(ArchiveSummary { tables, rows, bytes })
        }
        Err(e) => {
            archive.fail(e.clone()).await;
            Err(e)
        }
    }
}

async fn write_entries(
    connection: &dyn Connection,
    ctx: &QueryContext,
    archive: &mut ArchiveWriter,
) -> Result<(usize, u64)> {
    let extractor = TableExtractor::new(connection, ctx);

    let tables = extractor.discover_tables().await?;
    let schema = extractor.build_schema(&tables).await?;
    archive.append(SCHEMA_ENTRY_NAME, Bytes::from(schema)).await?;

    let mut rows = 0;
    for table in &tables {
        let document = extractor.export_table(table).await?;
        rows += document.rows;
        archive
            .append(&document.entry_name, Bytes::from(document.body))
            .await?;
    }

    Ok((tables.len(), rows))
}
