use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Byte sink a body is pumped into, one chunk at a time.
#[async_trait]
pub trait Sink: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
}

/// What a [`TeeWriter`] does when one of its destinations fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Remember the failure, skip the destination from then on and keep going.
    Ignore,
    /// Return the error to the caller, aborting the transfer.
    Propagate,
}

/// One side of a [`TeeWriter`].
pub struct Destination<W> {
    name: &'static str,
    writer: W,
    policy: FailurePolicy,
    failure: Option<io::ErrorKind>,
}

impl<W> Destination<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(name: &'static str, writer: W, policy: FailurePolicy) -> Self {
        Self {
            name,
            writer,
            policy,
            failure: None,
        }
    }

    /// Starts the destination already disabled, as if an earlier write had failed with
    /// `failure`.
    pub fn with_failure(mut self, failure: Option<io::ErrorKind>) -> Self {
        self.failure = failure;
        self
    }

    /// Kind of the error that disabled this destination, if any.
    pub fn failure(&self) -> Option<io::ErrorKind> {
        self.failure
    }

    fn settle(&mut self, result: io::Result<()>, operation: &'static str) -> io::Result<()> {
        let Err(err) = result else {
            return Ok(());
        };
        match self.policy {
            FailurePolicy::Propagate => Err(err),
            FailurePolicy::Ignore => {
                debug!(
                    destination = self.name,
                    operation,
                    error = %err,
                    "tee destination failed; skipping it for the rest of the transfer"
                );
                self.failure = Some(err.kind());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<W> Sink for Destination<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }
        let result = self.writer.write_all(buf).await;
        self.settle(result, "write")
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }
        let result = self.writer.flush().await;
        self.settle(result, "flush")
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }
        let result = self.writer.shutdown().await;
        self.settle(result, "close")
    }
}

/// Duplicates every write to two destinations, `first` before `second`.
///
/// Each destination carries its own [`FailurePolicy`]. The caching proxy puts the cache file
/// first with [`FailurePolicy::Propagate`] and the client second with
/// [`FailurePolicy::Ignore`], so a client that hangs up mid-transfer still leaves a complete
/// file behind.
pub struct TeeWriter<A, B> {
    first: Destination<A>,
    second: Destination<B>,
}

impl<A, B> TeeWriter<A, B>
where
    A: AsyncWrite + Unpin,
    B: AsyncWrite + Unpin,
{
    pub fn new(first: Destination<A>, second: Destination<B>) -> Self {
        Self { first, second }
    }

    pub fn second(&self) -> &Destination<B> {
        &self.second
    }
}

#[async_trait]
impl<A, B> Sink for TeeWriter<A, B>
where
    A: AsyncWrite + Unpin + Send,
    B: AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.first.write_all(buf).await?;
        self.second.write_all(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.first.flush().await?;
        self.second.flush().await
    }

    /// Closes both destinations even when the first one fails; the first error wins.
    async fn close(&mut self) -> io::Result<()> {
        let first = self.first.close().await;
        let second = self.second.close().await;
        first.and(second)
    }
}
