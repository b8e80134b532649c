//! Connection and row-source traits

use async_trait::async_trait;

use crate::{QueryContext, Result, Value};

/// A lazy, finite, non-restartable sequence of rows produced by one query.
///
/// A row source holds a live cursor until it is exhausted or closed.
/// `close` must be called on every exit path; calling it again, or after
/// the rows ran out, is a no-op.
#[async_trait]
pub trait RowSource: Send {
    /// Column names, in result order
    fn columns(&self) -> &[String];

    /// Fetch the next row, or `None` once the cursor is exhausted.
    ///
    /// Fails with `DumpError::RowScan` when a column cannot be decoded and
    /// with `DumpError::Query` when the server aborts the query mid-stream.
    async fn next_row(&mut self, ctx: &QueryContext) -> Result<Option<Vec<Value>>>;

    /// Release the cursor
    async fn close(&mut self);

    /// Number of rows handed out so far
    fn rows_read(&self) -> u64;
}

/// A database connection, exclusively owned by one export
#[async_trait]
pub trait Connection: Send + Sync {
    /// Start a query and return a cursor over its rows.
    ///
    /// `params` bind positional text parameters (`$1`, `$2`, ...).
    async fn query<'a>(
        &'a self,
        sql: &str,
        params: &[&str],
        ctx: &QueryContext,
    ) -> Result<Box<dyn RowSource + 'a>>;

    /// Run a small query and collect every row.
    ///
    /// Intended for catalog lookups; data queries should stream through
    /// [`Connection::query`] instead.
    async fn query_all(
        &self,
        sql: &str,
        params: &[&str],
        ctx: &QueryContext,
    ) -> Result<Vec<Vec<Value>>> {
        let mut source = self.query(sql, params, ctx).await?;
        let mut rows = Vec::new();
        let outcome = loop {
            match source.next_row(ctx).await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break Ok(rows),
                Err(e) => break Err(e),
            }
        };
        source.close().await;
        outcome
    }

    /// Close the connection. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Opens connections on behalf of the pipeline's producer task
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection, failing with `DumpError::Connection` when the
    /// database cannot be reached.
    async fn connect(&self, ctx: &QueryContext) -> Result<Box<dyn Connection>>;
}
