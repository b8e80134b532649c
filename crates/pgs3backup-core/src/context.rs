//! Export-wide deadline and cancellation

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{DumpError, Result};

/// Context passed explicitly to every catalog query and row fetch.
///
/// All queries of one export share a single absolute deadline. The
/// cancellation token is tripped by the pipeline coordinator when the
/// consumer side fails, so a producer waiting on the database unwinds
/// without issuing further queries.
#[derive(Debug, Clone)]
pub struct QueryContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl QueryContext {
    /// Create a context whose deadline is `timeout` from now
    pub fn new(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout, CancellationToken::new())
    }

    pub fn with_deadline(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a database operation under the deadline and cancellation signal.
    ///
    /// `operation` names the call in the resulting `Timeout` / `Cancelled` error.
    pub async fn run<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DumpError::Cancelled(format!("{} not started, export cancelled", operation)));
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(operation, "database operation cancelled");
                Err(DumpError::Cancelled(format!("{} interrupted, export cancelled", operation)))
            }
            outcome = tokio::time::timeout_at(self.deadline, future) => match outcome {
                Ok(result) => result,
                Err(_) => Err(DumpError::Timeout(format!(
                    "{} exceeded the export deadline",
                    operation
                ))),
            },
        }
    }
}
