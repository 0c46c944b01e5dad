//! Test doubles shared by unit tests, integration tests and `sdk-lab`.
//!
//! Everything here is in-memory and deterministic. Scripted sources replay
//! a fixed list of results and then wait until closed.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::core::{EventProcessor, ListenerId, PlatformListener, PlatformState, SyncOptions};
use crate::datasource::{
    ClientContext, CloseSignal, DataSource, DataSourceFactory, DataSourceState,
    DataSourceUpdateSink, Initializer, InitializerFactory, SourceFuture, SourceResult,
    Synchronizer, SynchronizerFactory,
};
use crate::error::{Result, SyncError};
use crate::types::{ChangeSet, EvaluationContext, Flag, Selector};
use crate::utils::ResultCallback;

pub use crate::core::InMemoryStore;

pub const TEST_MOBILE_KEY: &str = "mob-test-key";

/// Client context for `user-1` writing to a fresh [`RecordingSink`].
///
/// Must be called from inside a tokio runtime.
pub fn create_test_client_context() -> ClientContext {
    create_test_client_context_with_sink(Arc::new(RecordingSink::new()))
}

pub fn create_test_client_context_with_sink(sink: Arc<dyn DataSourceUpdateSink>) -> ClientContext {
    ClientContext {
        evaluation_context: EvaluationContext::new("user-1"),
        in_background: false,
        has_cached_data: false,
        sink,
        runtime: Handle::current(),
        options: Arc::new(SyncOptions::new(TEST_MOBILE_KEY)),
    }
}

/// Sink that records everything written to it.
#[derive(Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<(EvaluationContext, ChangeSet)>>,
    upserts: Mutex<Vec<Flag>>,
    statuses: Mutex<Vec<(DataSourceState, Option<SyncError>)>>,
    selector: Mutex<Option<Selector>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<DataSourceState> {
        self.statuses.lock().iter().map(|(state, _)| *state).collect()
    }

    /// Errors attached to recorded statuses, in order, skipping `None`.
    pub fn errors(&self) -> Vec<SyncError> {
        self.statuses
            .lock()
            .iter()
            .filter_map(|(_, error)| error.clone())
            .collect()
    }

    pub fn last_status(&self) -> Option<DataSourceState> {
        self.statuses.lock().last().map(|(state, _)| *state)
    }

    pub fn change_sets(&self) -> Vec<ChangeSet> {
        self.applied
            .lock()
            .iter()
            .map(|(_, change_set)| change_set.clone())
            .collect()
    }

    /// Sorted flag keys of each applied change set.
    pub fn applied_keys(&self) -> Vec<Vec<String>> {
        self.applied
            .lock()
            .iter()
            .map(|(_, change_set)| {
                let mut keys: Vec<String> = change_set.items.keys().cloned().collect();
                keys.sort();
                keys
            })
            .collect()
    }

    pub fn upserts(&self) -> Vec<Flag> {
        self.upserts.lock().clone()
    }
}

impl DataSourceUpdateSink for RecordingSink {
    fn apply(&self, context: &EvaluationContext, change_set: ChangeSet) {
        if !change_set.selector.is_empty() {
            *self.selector.lock() = Some(change_set.selector.clone());
        }
        self.applied.lock().push((context.clone(), change_set));
    }

    fn upsert(&self, _context: &EvaluationContext, flag: Flag) -> bool {
        self.upserts.lock().push(flag);
        true
    }

    fn set_status(&self, state: DataSourceState, error: Option<SyncError>) {
        self.statuses.lock().push((state, error));
    }

    fn selector(&self) -> Selector {
        self.selector.lock().clone().unwrap_or(Selector::EMPTY)
    }
}

/// Initializer that resolves with a fixed outcome.
pub struct ScriptedInitializer {
    outcome: Mutex<Option<Result<SourceResult>>>,
    signal: CloseSignal,
}

impl ScriptedInitializer {
    pub fn new(outcome: Result<SourceResult>) -> Self {
        Self {
            outcome: Mutex::new(Some(outcome)),
            signal: CloseSignal::new(),
        }
    }

    /// Initializer that never resolves until closed.
    pub fn pending() -> Self {
        Self {
            outcome: Mutex::new(None),
            signal: CloseSignal::new(),
        }
    }

    pub fn factory(outcome: Result<SourceResult>) -> impl InitializerFactory + Clone + 'static {
        move |_: &ClientContext| {
            Some(Arc::new(ScriptedInitializer::new(outcome.clone())) as Arc<dyn Initializer>)
        }
    }
}

impl Initializer for ScriptedInitializer {
    fn run(&self) -> SourceFuture {
        let outcome = self.outcome.lock().take();
        let signal = self.signal.clone();
        Box::pin(async move {
            match outcome {
                Some(outcome) => signal.guard(async move { outcome }).await,
                None => {
                    signal.closed().await;
                    Ok(SourceResult::shutdown())
                }
            }
        })
    }

    fn close(&self) {
        self.signal.close();
    }
}

/// Synchronizer that replays a script, then waits until closed.
pub struct ScriptedSynchronizer {
    script: Mutex<VecDeque<Result<SourceResult>>>,
    signal: CloseSignal,
    polls: AtomicUsize,
}

impl ScriptedSynchronizer {
    pub fn new(script: Vec<Result<SourceResult>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            signal: CloseSignal::new(),
            polls: AtomicUsize::new(0),
        }
    }

    /// Each build gets a fresh copy of `script`.
    pub fn factory(
        script: Vec<Result<SourceResult>>,
    ) -> impl SynchronizerFactory + Clone + 'static {
        Self::counted_factory(script, Arc::new(AtomicUsize::new(0)))
    }

    /// Like [`factory`](Self::factory), counting builds in `built`.
    pub fn counted_factory(
        script: Vec<Result<SourceResult>>,
        built: Arc<AtomicUsize>,
    ) -> impl SynchronizerFactory + Clone + 'static {
        move |_: &ClientContext| {
            built.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(ScriptedSynchronizer::new(script.clone())) as Arc<dyn Synchronizer>)
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

impl Synchronizer for ScriptedSynchronizer {
    fn next(&self) -> SourceFuture {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let item = self.script.lock().pop_front();
        let signal = self.signal.clone();
        Box::pin(async move {
            match item {
                Some(item) => signal.guard(async move { item }).await,
                None => {
                    signal.closed().await;
                    Ok(SourceResult::shutdown())
                }
            }
        })
    }

    fn close(&self) {
        self.signal.close();
    }
}

/// Data source that reports success as soon as it starts.
///
/// When built with flags it writes them as a full change set before
/// reporting VALID.
pub struct RecordingDataSource {
    client_context: ClientContext,
    flags: Vec<Flag>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RecordingDataSource {
    pub fn in_background(&self) -> bool {
        self.client_context.in_background
    }

    pub fn context(&self) -> &EvaluationContext {
        &self.client_context.evaluation_context
    }

    pub fn has_cached_data(&self) -> bool {
        self.client_context.has_cached_data
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Report a status through the sink as a transport would.
    pub fn report(&self, state: DataSourceState, error: Option<SyncError>) {
        self.client_context.sink.set_status(state, error);
    }
}

impl DataSource for RecordingDataSource {
    fn start(&self, callback: ResultCallback<bool>) {
        self.started.store(true, Ordering::SeqCst);
        if !self.flags.is_empty() {
            self.client_context.sink.apply(
                &self.client_context.evaluation_context,
                ChangeSet::full(self.flags.clone(), Selector::new(1, "recorded")),
            );
        }
        self.client_context
            .sink
            .set_status(DataSourceState::Valid, None);
        callback(Ok(true));
    }

    fn stop(&self, callback: ResultCallback<()>) {
        self.stopped.store(true, Ordering::SeqCst);
        callback(Ok(()));
    }

    fn needs_refresh(&self, in_background: bool, context: &EvaluationContext) -> bool {
        in_background != self.client_context.in_background
            || context.fully_qualified_key()
                != self.client_context.evaluation_context.fully_qualified_key()
    }
}

/// Factory producing [`RecordingDataSource`]s and keeping every one built.
#[derive(Default)]
pub struct RecordingDataSourceFactory {
    flags: Vec<Flag>,
    failure: Option<SyncError>,
    built: Mutex<Vec<Arc<RecordingDataSource>>>,
}

impl RecordingDataSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(flags: Vec<Flag>) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Factory whose every build fails with `error`.
    pub fn failing(error: SyncError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn built(&self) -> Vec<Arc<RecordingDataSource>> {
        self.built.lock().clone()
    }

    pub fn build_count(&self) -> usize {
        self.built.lock().len()
    }

    pub fn last(&self) -> Option<Arc<RecordingDataSource>> {
        self.built.lock().last().cloned()
    }
}

impl DataSourceFactory for RecordingDataSourceFactory {
    fn build(&self, client_context: &ClientContext) -> Result<Arc<dyn DataSource>> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let source = Arc::new(RecordingDataSource {
            client_context: client_context.clone(),
            flags: self.flags.clone(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        self.built.lock().push(Arc::clone(&source));
        Ok(source)
    }
}

/// Platform state driven by the test. Online and in the foreground by
/// default; setters fire listeners synchronously.
pub struct MockPlatformState {
    network_available: AtomicBool,
    foreground: AtomicBool,
    next_id: AtomicU64,
    connectivity_listeners: Mutex<HashMap<ListenerId, PlatformListener>>,
    foreground_listeners: Mutex<HashMap<ListenerId, PlatformListener>>,
}

impl MockPlatformState {
    pub fn new() -> Self {
        Self {
            network_available: AtomicBool::new(true),
            foreground: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            connectivity_listeners: Mutex::new(HashMap::new()),
            foreground_listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_network_available(&self, available: bool) {
        self.network_available.store(available, Ordering::SeqCst);
        let listeners: Vec<_> = self.connectivity_listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(available);
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
        let listeners: Vec<_> = self.foreground_listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(foreground);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.connectivity_listeners.lock().len() + self.foreground_listeners.lock().len()
    }
}

impl Default for MockPlatformState {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformState for MockPlatformState {
    fn is_network_available(&self) -> bool {
        self.network_available.load(Ordering::SeqCst)
    }

    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn add_connectivity_listener(&self, listener: PlatformListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connectivity_listeners.lock().insert(id, listener);
        id
    }

    fn remove_connectivity_listener(&self, id: ListenerId) {
        self.connectivity_listeners.lock().remove(&id);
    }

    fn add_foreground_listener(&self, listener: PlatformListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.foreground_listeners.lock().insert(id, listener);
        id
    }

    fn remove_foreground_listener(&self, id: ListenerId) {
        self.foreground_listeners.lock().remove(&id);
    }
}

/// Event processor that remembers the last signals it received.
#[derive(Default)]
pub struct RecordingEventProcessor {
    offline: Mutex<Option<bool>>,
    in_background: Mutex<Option<bool>>,
}

impl RecordingEventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_offline(&self) -> Option<bool> {
        *self.offline.lock()
    }

    pub fn is_in_background(&self) -> Option<bool> {
        *self.in_background.lock()
    }
}

impl EventProcessor for RecordingEventProcessor {
    fn set_offline(&self, offline: bool) {
        *self.offline.lock() = Some(offline);
    }

    fn set_in_background(&self, in_background: bool) {
        *self.in_background.lock() = Some(in_background);
    }
}
