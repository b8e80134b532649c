//! Bounded in-process byte pipe connecting two pipeline stages
//!
//! A pipe carries a sequence of byte chunks followed by exactly one terminal
//! message: a clean finish, or a failure that the reader observes as its
//! last item. Writes suspend while `capacity` chunks are in flight, so a slow
//! consumer throttles the producer instead of growing a buffer.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use pgs3backup_core::{DumpError, Result};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Message {
    Data(Bytes),
    Finish,
    Fail(DumpError),
}

/// Create a pipe holding at most `capacity` chunks in flight
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter {
            tx,
            bytes_written: 0,
        },
        PipeReader {
            rx,
            state: ReaderState::Open,
            bytes_read: 0,
        },
    )
}

/// Producer end of a [`pipe`].
///
/// Consumed by [`PipeWriter::finish`] or [`PipeWriter::fail`]. Dropping a
/// writer without either is reported to the reader as an aborted stream.
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<Message>,
    bytes_written: u64,
}

impl PipeWriter {
    /// Send one chunk, waiting while the pipe is full.
    ///
    /// Fails with `DumpError::Cancelled` once the reader has gone away.
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;
        self.tx
            .send(Message::Data(chunk))
            .await
            .map_err(|_| DumpError::Cancelled("pipe reader closed".to_string()))?;
        self.bytes_written += len;
        Ok(())
    }

    /// Signal a clean end of stream and return the number of bytes written
    pub async fn finish(self) -> Result<u64> {
        self.tx
            .send(Message::Finish)
            .await
            .map_err(|_| DumpError::Cancelled("pipe reader closed before finish".to_string()))?;
        Ok(self.bytes_written)
    }

    /// Terminate the stream with `err`; the reader sees it as its final item
    pub async fn fail(self, err: DumpError) {
        if self.tx.send(Message::Fail(err)).await.is_err() {
            tracing::debug!("pipe reader already closed, failure not delivered");
        }
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Open,
    Finished,
    Failed,
    Closed,
}

/// Consumer end of a [`pipe`]
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Message>,
    state: ReaderState,
    bytes_read: u64,
}

impl PipeReader {
    /// Receive the next chunk.
    ///
    /// Returns `None` after a clean finish, and `Some(Err(_))` exactly once
    /// when the writer failed or was dropped without finishing.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        std::future::poll_fn(|cx| self.poll_next_chunk(cx)).await
    }

    /// Stop reading. Pending and future writes fail with `Cancelled`.
    ///
    /// Closing an already terminated or closed reader is a no-op.
    pub fn close(&mut self) {
        if self.state == ReaderState::Open {
            self.state = ReaderState::Closed;
            self.rx.close();
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn poll_next_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        if self.state != ReaderState::Open {
            return Poll::Ready(None);
        }

        match ready!(self.rx.poll_recv(cx)) {
            Some(Message::Data(chunk)) => {
                self.bytes_read += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Message::Finish) => {
                self.state = ReaderState::Finished;
                self.rx.close();
                Poll::Ready(None)
            }
            Some(Message::Fail(err)) => {
                self.state = ReaderState::Failed;
                self.rx.close();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                self.state = ReaderState::Failed;
                Poll::Ready(Some(Err(DumpError::Cancelled(
                    "pipe writer dropped before finishing".to_string(),
                ))))
            }
        }
    }
}

impl Stream for PipeReader {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_chunk(cx)
    }
}
