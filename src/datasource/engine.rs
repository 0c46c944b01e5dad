//! The multi-source synchronization engine.
//!
//! One tokio task per engine walks the initializers, then drives the
//! current synchronizer, racing each `next()` against the fallback and
//! recovery conditions and the stop signal. Start callbacks from any number
//! of callers are satisfied from that single run.
//!
//! # Example
//!
//! ```no_run
//! use flagkit_sync::datasource::{ClientContext, DataSourceFactory, SyncEngineBuilder};
//! # fn demo(client_context: ClientContext) -> flagkit_sync::error::Result<()> {
//! let builder = SyncEngineBuilder::new();
//! let engine = builder.build(&client_context)?;
//! engine.start(Box::new(|started| println!("started: {:?}", started)));
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use super::conditions::{ConditionKind, Conditions};
use super::source::{
    CloseSignal, InitializerFactory, SourceResult, SourceStatus, SynchronizerFactory,
};
use super::source_manager::SourceManager;
use super::{ClientContext, DataSource, DataSourceFactory, DataSourceState, DataSourceUpdateSink};
use crate::error::{Result, SyncError};
use crate::types::EvaluationContext;
use crate::utils::ResultCallback;

#[derive(Default)]
struct StartState {
    outcome: Option<Result<bool>>,
    pending: Vec<ResultCallback<bool>>,
}

/// How the synchronizer phase ended.
enum SyncExit {
    Stopped,
    Shutdown,
    Exhausted(Option<SyncError>),
}

struct EngineInner {
    context: EvaluationContext,
    in_background: bool,
    sink: Arc<dyn DataSourceUpdateSink>,
    sources: SourceManager,
    fallback_timeout: Duration,
    recovery_timeout: Duration,
    runtime: Handle,
    started: AtomicBool,
    stopped: AtomicBool,
    stop_signal: CloseSignal,
    start_state: Mutex<StartState>,
}

/// Data source that runs initializers, then synchronizers with fallback.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        client_context: &ClientContext,
        initializers: Vec<Arc<dyn InitializerFactory>>,
        synchronizers: Vec<Arc<dyn SynchronizerFactory>>,
        fallback_timeout: Duration,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                context: client_context.evaluation_context.clone(),
                in_background: client_context.in_background,
                sink: Arc::clone(&client_context.sink),
                sources: SourceManager::new(client_context.clone(), initializers, synchronizers),
                fallback_timeout,
                recovery_timeout,
                runtime: client_context.runtime.clone(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stop_signal: CloseSignal::new(),
                start_state: Mutex::new(StartState::default()),
            }),
        }
    }

    /// Whether the start outcome has been decided.
    pub fn is_start_completed(&self) -> bool {
        self.inner.start_state.lock().outcome.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl DataSource for SyncEngine {
    fn start(&self, callback: ResultCallback<bool>) {
        {
            let mut state = self.inner.start_state.lock();
            if let Some(outcome) = state.outcome.clone() {
                drop(state);
                callback(outcome);
                return;
            }
            state.pending.push(callback);
        }

        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            inner.run().await;
        });
    }

    fn stop(&self, callback: ResultCallback<()>) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Stopping synchronization engine");
            self.inner.stop_signal.close();
            self.inner.sources.close();
            self.inner.sink.set_status(DataSourceState::Off, None);
            self.inner.complete_start(Ok(false));
        }
        callback(Ok(()));
    }

    fn needs_refresh(&self, in_background: bool, context: &EvaluationContext) -> bool {
        in_background != self.inner.in_background
            || context.fully_qualified_key() != self.inner.context.fully_qualified_key()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.stop_signal.close();
        self.inner.sources.close();
    }
}

impl EngineInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Record the start outcome and fire every queued callback. Only the
    /// first outcome counts.
    fn complete_start(&self, outcome: Result<bool>) {
        let pending = {
            let mut state = self.start_state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.pending)
        };
        for callback in pending {
            callback(outcome.clone());
        }
    }

    fn is_start_completed(&self) -> bool {
        self.start_state.lock().outcome.is_some()
    }

    async fn run(&self) {
        if self.is_stopped() {
            self.complete_start(Ok(false));
            return;
        }

        if !self.sources.has_available_sources() {
            tracing::info!("No initializers or synchronizers; data source will not connect");
            self.sink.set_status(DataSourceState::Valid, None);
            self.complete_start(Ok(true));
            return;
        }

        if self.sources.has_initializers() {
            self.run_initializers().await;
        }

        if self.sources.available_synchronizer_count() == 0 {
            self.sources.close();
            if !self.is_start_completed() && !self.is_stopped() {
                tracing::info!("All initializers exhausted and no synchronizers are available");
                self.sink
                    .set_status(DataSourceState::Off, Some(SyncError::exhausted()));
            }
            self.complete_start(Ok(false));
            return;
        }

        let exit = self.run_synchronizers().await;
        self.sources.close();
        match exit {
            SyncExit::Stopped => {}
            SyncExit::Shutdown => {
                tracing::debug!("Synchronizer shut down");
                self.sink.set_status(DataSourceState::Off, None);
            }
            SyncExit::Exhausted(last_error) => {
                tracing::info!("All data source acquisition methods have been exhausted");
                self.sink.set_status(
                    DataSourceState::Off,
                    Some(last_error.unwrap_or_else(SyncError::exhausted)),
                );
            }
        }
        self.complete_start(Ok(false));
    }

    async fn run_initializers(&self) {
        let mut any_data_received = false;

        while let Some(initializer) = self.sources.next_initializer() {
            if self.is_stopped() {
                return;
            }

            let outcome = tokio::select! {
                biased;
                _ = self.stop_signal.closed() => return,
                outcome = initializer.run() => outcome,
            };

            match outcome {
                Ok(SourceResult::ChangeSet(change_set)) => {
                    let complete = !change_set.selector.is_empty();
                    self.sink.apply(&self.context, change_set);
                    any_data_received = true;
                    if complete {
                        self.sink.set_status(DataSourceState::Valid, None);
                        self.complete_start(Ok(true));
                        return;
                    }
                }
                Ok(SourceResult::Status(SourceStatus::Interrupted(error))) => {
                    self.sink.set_status(DataSourceState::Interrupted, error);
                }
                Ok(SourceResult::Status(SourceStatus::TerminalError(error))) => {
                    self.sink
                        .set_status(DataSourceState::Interrupted, Some(error));
                }
                Ok(SourceResult::Status(SourceStatus::Goodbye(_)))
                | Ok(SourceResult::Status(SourceStatus::Shutdown)) => {}
                Err(e) => {
                    tracing::warn!("Initializer error: {}", e);
                    self.sink.set_status(DataSourceState::Interrupted, Some(e));
                }
            }
        }

        // Data without a selector from the last initializer still counts.
        if any_data_received && !self.is_stopped() {
            self.sink.set_status(DataSourceState::Valid, None);
            self.complete_start(Ok(true));
        }
    }

    async fn run_synchronizers(&self) -> SyncExit {
        let mut last_error = None;

        while let Some(synchronizer) = self.sources.next_synchronizer() {
            let available = self.sources.available_synchronizer_count();
            let is_prime = self.sources.is_prime_synchronizer();
            let mut conditions = Conditions::new(
                self.fallback_timeout,
                self.recovery_timeout,
                available,
                is_prime,
            );
            tracing::debug!(
                "Running synchronizer (prime: {}, available: {})",
                is_prime,
                available
            );

            loop {
                let outcome = tokio::select! {
                    biased;
                    _ = self.stop_signal.closed() => return SyncExit::Stopped,
                    kind = conditions.fired() => {
                        match kind {
                            ConditionKind::Fallback => {
                                tracing::info!(
                                    "Synchronizer experienced an interruption; falling back to next synchronizer"
                                );
                            }
                            ConditionKind::Recovery => {
                                tracing::info!(
                                    "Attempting to recover to a higher priority synchronizer"
                                );
                                self.sources.reset_source_index();
                            }
                        }
                        break;
                    }
                    outcome = synchronizer.next() => outcome,
                };

                let result = match outcome {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!("Synchronizer error: {}", e);
                        last_error = Some(e.clone());
                        self.sink.set_status(DataSourceState::Interrupted, Some(e));
                        tokio::task::yield_now().await;
                        break;
                    }
                };

                conditions.inform(&result);

                match result {
                    SourceResult::ChangeSet(change_set) => {
                        self.sink.apply(&self.context, change_set);
                        self.sink.set_status(DataSourceState::Valid, None);
                        self.complete_start(Ok(true));
                    }
                    SourceResult::Status(SourceStatus::Interrupted(error)) => {
                        if let Some(e) = &error {
                            last_error = Some(e.clone());
                        }
                        self.sink.set_status(DataSourceState::Interrupted, error);
                    }
                    SourceResult::Status(SourceStatus::TerminalError(error)) => {
                        self.sources.block_current_synchronizer();
                        last_error = Some(error.clone());
                        self.sink
                            .set_status(DataSourceState::Interrupted, Some(error));
                        break;
                    }
                    SourceResult::Status(SourceStatus::Goodbye(reason)) => {
                        tracing::debug!("Synchronizer said goodbye: {}", reason);
                    }
                    SourceResult::Status(SourceStatus::Shutdown) => {
                        if self.is_stopped() {
                            return SyncExit::Stopped;
                        }
                        return SyncExit::Shutdown;
                    }
                }
            }
        }

        if self.is_stopped() {
            SyncExit::Stopped
        } else {
            SyncExit::Exhausted(last_error)
        }
    }
}

/// Builds [`SyncEngine`]s from factory lists.
///
/// Background builds use the background synchronizers when any are
/// configured and skip initializers when the context already has cached
/// data.
#[derive(Default, Clone)]
pub struct SyncEngineBuilder {
    initializers: Vec<Arc<dyn InitializerFactory>>,
    synchronizers: Vec<Arc<dyn SynchronizerFactory>>,
    background_synchronizers: Vec<Arc<dyn SynchronizerFactory>>,
    fallback_timeout: Option<Duration>,
    recovery_timeout: Option<Duration>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initializer(mut self, factory: impl InitializerFactory + 'static) -> Self {
        self.initializers.push(Arc::new(factory));
        self
    }

    pub fn synchronizer(mut self, factory: impl SynchronizerFactory + 'static) -> Self {
        self.synchronizers.push(Arc::new(factory));
        self
    }

    pub fn background_synchronizer(mut self, factory: impl SynchronizerFactory + 'static) -> Self {
        self.background_synchronizers.push(Arc::new(factory));
        self
    }

    /// Override the configured fallback timeout.
    pub fn fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = Some(timeout);
        self
    }

    /// Override the configured recovery timeout.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = Some(timeout);
        self
    }

    pub fn build_engine(&self, client_context: &ClientContext) -> SyncEngine {
        let initializers = if client_context.in_background && client_context.has_cached_data {
            Vec::new()
        } else {
            self.initializers.clone()
        };
        let synchronizers =
            if client_context.in_background && !self.background_synchronizers.is_empty() {
                self.background_synchronizers.clone()
            } else {
                self.synchronizers.clone()
            };

        SyncEngine::new(
            client_context,
            initializers,
            synchronizers,
            self.fallback_timeout
                .unwrap_or(client_context.options.fallback_timeout),
            self.recovery_timeout
                .unwrap_or(client_context.options.recovery_timeout),
        )
    }
}

impl DataSourceFactory for SyncEngineBuilder {
    fn build(&self, client_context: &ClientContext) -> Result<Arc<dyn DataSource>> {
        Ok(Arc::new(self.build_engine(client_context)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        create_test_client_context_with_sink, RecordingSink, ScriptedInitializer,
        ScriptedSynchronizer,
    };
    use crate::types::{ChangeSet, Flag, Selector};
    use crate::utils::AwaitableFuture;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_source_lists_start_valid() {
        let sink = Arc::new(RecordingSink::new());
        let context = create_test_client_context_with_sink(sink.clone());
        let engine = SyncEngineBuilder::new().build_engine(&context);

        let started = AwaitableFuture::new();
        engine.start(started.callback());
        assert!(started.wait_timeout(Duration::from_secs(1)).await.unwrap());
        assert_eq!(sink.statuses(), vec![DataSourceState::Valid]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_skips_initializers_when_cached() {
        let sink = Arc::new(RecordingSink::new());
        let mut context = create_test_client_context_with_sink(sink.clone());
        context.in_background = true;
        context.has_cached_data = true;

        let builder = SyncEngineBuilder::new()
            .initializer(ScriptedInitializer::factory(Ok(SourceResult::ChangeSet(
                ChangeSet::full(vec![Flag::new("a", true, 1)], Selector::new(1, "s")),
            ))))
            .background_synchronizer(ScriptedSynchronizer::factory(vec![Ok(
                SourceResult::ChangeSet(ChangeSet::partial(
                    vec![Flag::new("b", true, 1)],
                    Selector::EMPTY,
                )),
            )]));
        let engine = builder.build_engine(&context);

        let started = AwaitableFuture::new();
        engine.start(started.callback());
        assert!(started.wait_timeout(Duration::from_secs(1)).await.unwrap());
        let applied = sink.applied_keys();
        assert_eq!(applied, vec![vec!["b".to_string()]]);

        let stopped = AwaitableFuture::new();
        engine.stop(stopped.callback());
        stopped.wait_timeout(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_needs_refresh() {
        let context = create_test_client_context_with_sink(Arc::new(RecordingSink::new()));
        let engine = SyncEngineBuilder::new().build_engine(&context);
        assert!(!engine.needs_refresh(false, &context.evaluation_context));
        assert!(engine.needs_refresh(true, &context.evaluation_context));
        assert!(engine.needs_refresh(false, &EvaluationContext::new("someone-else")));
    }
}
