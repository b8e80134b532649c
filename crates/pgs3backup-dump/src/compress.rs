//! Gzip stage between two pipes

use std::io::Write;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use pgs3backup_core::{DumpError, Result};

use crate::pipe::{PipeReader, PipeWriter};

fn compression_error(e: std::io::Error) -> DumpError {
    DumpError::Compression(e.to_string())
}

/// Compress everything read from `input` into `output`.
///
/// The gzip trailer is written once, after `input` finished cleanly. A
/// failure arriving on `input` is forwarded to `output` unchanged and the
/// stage itself returns `Ok`; the stage's own errors are sent downstream
/// and returned.
pub async fn gzip_stage(
    mut input: PipeReader,
    mut output: PipeWriter,
    level: Compression,
) -> Result<u64> {
    let mut encoder = GzEncoder::new(Vec::new(), level);

    while let Some(chunk) = input.next_chunk().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(upstream) => {
                tracing::debug!(error = %upstream, "forwarding upstream failure");
                output.fail(upstream).await;
                return Ok(0);
            }
        };

        if let Err(e) = encoder.write_all(&chunk) {
            let err = compression_error(e);
            input.close();
            output.fail(err.clone()).await;
            return Err(err);
        }

        let compressed = std::mem::take(encoder.get_mut());
        if compressed.is_empty() {
            continue;
        }
        if let Err(e) = output.write(Bytes::from(compressed)).await {
            input.close();
            return Err(e);
        }
    }

    let tail = match encoder.finish() {
        Ok(tail) => tail,
        Err(e) => {
            let err = compression_error(e);
            output.fail(err.clone()).await;
            return Err(err);
        }
    };
    output.write(Bytes::from(tail)).await?;

    let total = output.finish().await?;
    tracing::debug!(
        input_bytes = input.bytes_read(),
        output_bytes = total,
        "compression finished"
    );
    Ok(total)
}
