//! Initializer and synchronizer abstractions.
//!
//! An initializer produces one result and is done. A synchronizer is polled
//! repeatedly with [`Synchronizer::next`] for a stream of results. Closing
//! either resolves any pending future with [`SourceStatus::Shutdown`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

use super::ClientContext;
use crate::error::{Result, SyncError};
use crate::types::ChangeSet;

/// Non-data outcome of a source poll.
#[derive(Debug, Clone)]
pub enum SourceStatus {
    /// Transient problem; the source will keep trying.
    Interrupted(Option<SyncError>),
    /// The source cannot recover and should not be used again.
    TerminalError(SyncError),
    /// Server-initiated graceful rotation.
    Goodbye(String),
    /// The source was closed.
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum SourceResult {
    ChangeSet(ChangeSet),
    Status(SourceStatus),
}

impl SourceResult {
    pub fn interrupted(error: Option<SyncError>) -> Self {
        SourceResult::Status(SourceStatus::Interrupted(error))
    }

    pub fn terminal_error(error: SyncError) -> Self {
        SourceResult::Status(SourceStatus::TerminalError(error))
    }

    pub fn goodbye(reason: impl Into<String>) -> Self {
        SourceResult::Status(SourceStatus::Goodbye(reason.into()))
    }

    pub fn shutdown() -> Self {
        SourceResult::Status(SourceStatus::Shutdown)
    }

    pub fn is_change_set(&self) -> bool {
        matches!(self, SourceResult::ChangeSet(_))
    }
}

impl From<ChangeSet> for SourceResult {
    fn from(change_set: ChangeSet) -> Self {
        SourceResult::ChangeSet(change_set)
    }
}

pub type SourceFuture = Pin<Box<dyn Future<Output = Result<SourceResult>> + Send>>;

/// One-shot data fetch.
pub trait Initializer: Send + Sync {
    fn run(&self) -> SourceFuture;

    fn close(&self);
}

/// Long-lived source yielding results one `next()` at a time.
pub trait Synchronizer: Send + Sync {
    fn next(&self) -> SourceFuture;

    fn close(&self);
}

pub trait InitializerFactory: Send + Sync {
    /// Build an initializer, or `None` to skip this slot.
    fn build(&self, client_context: &ClientContext) -> Option<Arc<dyn Initializer>>;
}

pub trait SynchronizerFactory: Send + Sync {
    /// Build a synchronizer, or `None` to skip this slot.
    fn build(&self, client_context: &ClientContext) -> Option<Arc<dyn Synchronizer>>;
}

impl<F> InitializerFactory for F
where
    F: Fn(&ClientContext) -> Option<Arc<dyn Initializer>> + Send + Sync,
{
    fn build(&self, client_context: &ClientContext) -> Option<Arc<dyn Initializer>> {
        self(client_context)
    }
}

impl<F> SynchronizerFactory for F
where
    F: Fn(&ClientContext) -> Option<Arc<dyn Synchronizer>> + Send + Sync,
{
    fn build(&self, client_context: &ClientContext) -> Option<Arc<dyn Synchronizer>> {
        self(client_context)
    }
}

/// Latching close flag shared between a source and its pending futures.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Run `work` unless the signal closes first, in which case the
    /// result is [`SourceResult::shutdown`].
    pub async fn guard<F>(&self, work: F) -> Result<SourceResult>
    where
        F: Future<Output = Result<SourceResult>>,
    {
        if self.is_closed() {
            return Ok(SourceResult::shutdown());
        }
        tokio::select! {
            result = work => result,
            _ = self.closed() => Ok(SourceResult::shutdown()),
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}
