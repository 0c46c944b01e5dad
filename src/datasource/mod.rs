//! Data sources and the multi-source synchronization engine.
//!
//! A [`DataSource`] is what the connectivity manager starts and stops. The
//! standard one is [`SyncEngine`], which runs a list of initializers and
//! then rotates through synchronizers, writing every result to a
//! [`DataSourceUpdateSink`].

pub mod conditions;
pub mod engine;
pub mod polling;
pub mod source;
pub mod source_manager;

pub use conditions::{ConditionKind, Conditions};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use polling::{
    fetch_fn, FetchFn, FetchFuture, PollingConfig, PollingInitializer, PollingSynchronizer,
};
pub use source::{
    CloseSignal, Initializer, InitializerFactory, SourceFuture, SourceResult, SourceStatus,
    Synchronizer, SynchronizerFactory,
};
pub use source_manager::SourceManager;

use std::sync::Arc;
use tokio::runtime::Handle;

use crate::core::SyncOptions;
use crate::error::{Result, SyncError};
use crate::types::{ChangeSet, EvaluationContext, Flag, Selector};
use crate::utils::ResultCallback;

/// Liveness of a data source as reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSourceState {
    Initializing,
    Valid,
    Interrupted,
    /// Terminal for this data source instance.
    Off,
}

impl DataSourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceState::Initializing => "INITIALIZING",
            DataSourceState::Valid => "VALID",
            DataSourceState::Interrupted => "INTERRUPTED",
            DataSourceState::Off => "OFF",
        }
    }
}

impl std::fmt::Display for DataSourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where data sources deliver data and status.
pub trait DataSourceUpdateSink: Send + Sync {
    fn apply(&self, context: &EvaluationContext, change_set: ChangeSet);

    /// Single-flag merge; returns whether the flag was stored.
    fn upsert(&self, context: &EvaluationContext, flag: Flag) -> bool;

    fn set_status(&self, state: DataSourceState, error: Option<SyncError>);

    /// Checkpoint a resuming transport should send.
    fn selector(&self) -> Selector;
}

/// Everything a factory needs to build a data source.
#[derive(Clone)]
pub struct ClientContext {
    pub evaluation_context: EvaluationContext,
    pub in_background: bool,
    /// Whether flag data for the context was already cached.
    pub has_cached_data: bool,
    pub sink: Arc<dyn DataSourceUpdateSink>,
    pub runtime: Handle,
    pub options: Arc<SyncOptions>,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("evaluation_context", &self.evaluation_context)
            .field("in_background", &self.in_background)
            .field("has_cached_data", &self.has_cached_data)
            .finish_non_exhaustive()
    }
}

pub trait DataSource: Send + Sync {
    /// Begin delivering data. `callback` receives `true` once data has
    /// arrived, `false` if the source gave up or was stopped first.
    fn start(&self, callback: ResultCallback<bool>);

    fn stop(&self, callback: ResultCallback<()>);

    /// Whether the source must be rebuilt for a new background state or
    /// context. Returning `false` keeps it running untouched.
    fn needs_refresh(&self, _in_background: bool, _context: &EvaluationContext) -> bool {
        true
    }
}

pub trait DataSourceFactory: Send + Sync {
    fn build(&self, client_context: &ClientContext) -> Result<Arc<dyn DataSource>>;
}

impl<F> DataSourceFactory for F
where
    F: Fn(&ClientContext) -> Result<Arc<dyn DataSource>> + Send + Sync,
{
    fn build(&self, client_context: &ClientContext) -> Result<Arc<dyn DataSource>> {
        self(client_context)
    }
}
