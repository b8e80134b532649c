//! Streaming cursor over a PostgreSQL result set

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use pgs3backup_core::{DumpError, QueryContext, Result, RowSource, Value};
use tokio_postgres::{CancelToken, NoTls, RowStream};

use crate::connection::format_postgres_error;
use crate::decode::decode_column;

const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Rows of one query, fetched from the server as they are consumed.
///
/// Rows are pulled through tokio-postgres' `RowStream`, so only the rows
/// the connection has buffered are held in memory at a time.
pub struct PostgresRowSource {
    stream: Option<Pin<Box<RowStream>>>,
    columns: Vec<String>,
    rendered: Vec<bool>,
    rows_read: u64,
    cancel_token: CancelToken,
}

impl PostgresRowSource {
    pub(crate) fn new(
        stream: RowStream,
        columns: Vec<String>,
        rendered: Vec<bool>,
        cancel_token: CancelToken,
    ) -> Self {
        Self {
            stream: Some(Box::pin(stream)),
            columns,
            rendered,
            rows_read: 0,
            cancel_token,
        }
    }
}

#[async_trait]
impl RowSource for PostgresRowSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self, ctx: &QueryContext) -> Result<Option<Vec<Value>>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let next = ctx
            .run("row fetch", async {
                stream.as_mut().try_next().await.map_err(|e| {
                    DumpError::Query(format!("Failed to fetch row: {}", format_postgres_error(&e)))
                })
            })
            .await?;

        let Some(pg_row) = next else {
            tracing::debug!(rows = self.rows_read, "result set exhausted");
            self.stream = None;
            return Ok(None);
        };

        self.rows_read += 1;
        let mut values = Vec::with_capacity(pg_row.len());
        for idx in 0..pg_row.len() {
            let rendered = self.rendered.get(idx).copied().unwrap_or(false);
            values.push(decode_column(&pg_row, idx, rendered, self.rows_read)?);
        }
        Ok(Some(values))
    }

    async fn close(&mut self) {
        // Only a cursor abandoned mid-stream still has a query running server side.
        let Some(stream) = self.stream.take() else {
            return;
        };
        drop(stream);

        tracing::debug!(rows = self.rows_read, "abandoning result set, cancelling query");
        match tokio::time::timeout(CANCEL_TIMEOUT, self.cancel_token.cancel_query(NoTls)).await {
            Ok(Ok(())) => tracing::debug!("PostgreSQL cancel request sent successfully"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to cancel PostgreSQL query"),
            Err(_) => tracing::warn!("PostgreSQL cancel request timed out"),
        }
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }
}
