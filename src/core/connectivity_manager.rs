//! Connection mode state machine.
//!
//! The manager folds three inputs (forced offline, network reachability and
//! foreground state) into one [`ConnectionMode`] and keeps at most one data
//! source running for it. Data sources write through a sink owned by the
//! manager, which forwards flag data to the [`ContextDataManager`] and
//! records connection successes and failures.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

use super::config::SyncOptions;
use super::context_data_manager::ContextDataManager;
use super::context_decorator::ContextDecorator;
use super::listeners::{ListenerHandle, ListenerRegistry};
use super::persistence::{PerEnvironmentData, PersistentStoreWrapper, SavedConnectionInfo};
use super::platform::{EventProcessor, ListenerId, PlatformState};
use super::task_executor::TaskExecutor;
use crate::datasource::{
    ClientContext, DataSource, DataSourceFactory, DataSourceState, DataSourceUpdateSink,
};
use crate::error::{ConnectionFailure, Result, SyncError};
use crate::types::{ChangeSet, EvaluationContext, Flag, Selector};
use crate::utils::{Debounce, ResultCallback, Throttler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMode {
    Streaming,
    Polling,
    BackgroundPolling,
    BackgroundDisabled,
    /// Device network unavailable.
    Offline,
    /// Offline by explicit request.
    SetOffline,
    Shutdown,
}

impl ConnectionMode {
    /// Resolve the mode for the current inputs, in priority order.
    pub fn resolve(
        force_offline: bool,
        network_available: bool,
        in_background: bool,
        options: &SyncOptions,
    ) -> Self {
        if force_offline {
            ConnectionMode::SetOffline
        } else if !network_available {
            ConnectionMode::Offline
        } else if in_background && options.disable_background_updating {
            ConnectionMode::BackgroundDisabled
        } else if in_background {
            ConnectionMode::BackgroundPolling
        } else if options.stream {
            ConnectionMode::Streaming
        } else {
            ConnectionMode::Polling
        }
    }

    /// Whether this mode runs a data source.
    pub fn is_connection_active(&self) -> bool {
        matches!(
            self,
            ConnectionMode::Streaming | ConnectionMode::Polling | ConnectionMode::BackgroundPolling
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Streaming => "STREAMING",
            ConnectionMode::Polling => "POLLING",
            ConnectionMode::BackgroundPolling => "BACKGROUND_POLLING",
            ConnectionMode::BackgroundDisabled => "BACKGROUND_DISABLED",
            ConnectionMode::Offline => "OFFLINE",
            ConnectionMode::SetOffline => "SET_OFFLINE",
            ConnectionMode::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current mode plus the most recent connection outcomes.
///
/// Success and failure records are kept independently; each is only
/// replaced by a newer record of the same kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInformation {
    pub connection_mode: ConnectionMode,
    /// Milliseconds since the Unix epoch.
    pub last_successful_connection: Option<i64>,
    pub last_failed_connection: Option<i64>,
    pub last_failure: Option<ConnectionFailure>,
}

impl ConnectionInformation {
    fn from_saved(mode: ConnectionMode, saved: SavedConnectionInfo) -> Self {
        Self {
            connection_mode: mode,
            last_successful_connection: saved.last_success_time,
            last_failed_connection: saved.last_failure_time,
            last_failure: saved.last_failure,
        }
    }

    fn to_saved(&self) -> SavedConnectionInfo {
        SavedConnectionInfo {
            last_success_time: self.last_successful_connection,
            last_failure_time: self.last_failed_connection,
            last_failure: self.last_failure.clone(),
        }
    }
}

/// Receives connection status changes on the task executor.
pub trait StatusListener: Send + Sync {
    fn on_connection_mode_changed(&self, info: &ConnectionInformation);

    fn on_internal_failure(&self, failure: &ConnectionFailure);
}

/// Keeps the data source in line with platform state.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use flagkit_sync::core::{
///     ConnectivityManager, ContextDataManager, InlineExecutor, NoOpEventProcessor,
///     PersistentStoreWrapper, SyncOptions,
/// };
/// use flagkit_sync::datasource::SyncEngineBuilder;
/// use flagkit_sync::testing::MockPlatformState;
/// use flagkit_sync::types::EvaluationContext;
///
/// # async fn example() -> flagkit_sync::Result<()> {
/// let options = SyncOptions::new("mob-key-123");
/// let store = PersistentStoreWrapper::in_memory();
/// let context = EvaluationContext::new("user-1");
/// let data = Arc::new(ContextDataManager::new(
///     store.per_environment(&options.mobile_key),
///     context,
///     options.max_cached_contexts,
///     Arc::new(InlineExecutor),
/// ));
///
/// let manager = ConnectivityManager::new(
///     options,
///     store,
///     data,
///     Arc::new(SyncEngineBuilder::new()),
///     Arc::new(MockPlatformState::new()),
///     Arc::new(NoOpEventProcessor),
///     Arc::new(InlineExecutor),
///     tokio::runtime::Handle::current(),
/// )?;
/// manager.start(Box::new(|_| {}));
/// # Ok(())
/// # }
/// ```
///
/// # Thread Safety
///
/// All methods take `&self` and may be called from any thread. Mode
/// transitions are serialized, and the previous data source is always
/// stopped before its replacement starts.
pub struct ConnectivityManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    options: Arc<SyncOptions>,
    runtime: Handle,
    context_data: Arc<ContextDataManager>,
    environment_store: PerEnvironmentData,
    decorator: ContextDecorator,
    factory: Arc<dyn DataSourceFactory>,
    platform: Arc<dyn PlatformState>,
    event_processor: Arc<dyn EventProcessor>,
    task_executor: Arc<dyn TaskExecutor>,
    status_listeners: ListenerRegistry<dyn StatusListener>,
    transition_lock: Mutex<()>,
    current_source: Mutex<Option<Arc<dyn DataSource>>>,
    connection: Mutex<ConnectionInformation>,
    platform_listeners: Mutex<Option<(ListenerId, ListenerId)>>,
    throttler: Throttler,
    save_debounce: Debounce,
    force_offline: AtomicBool,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ConnectivityManager {
    /// Create a manager. Nothing connects until [`start`](Self::start).
    ///
    /// Returns `ConfigInvalid` if `options` fail validation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: SyncOptions,
        store: PersistentStoreWrapper,
        context_data: Arc<ContextDataManager>,
        factory: Arc<dyn DataSourceFactory>,
        platform: Arc<dyn PlatformState>,
        event_processor: Arc<dyn EventProcessor>,
        task_executor: Arc<dyn TaskExecutor>,
        runtime: Handle,
    ) -> Result<Self> {
        options.validate()?;

        let environment_store = store.per_environment(&options.mobile_key);
        let decorator = ContextDecorator::new(store, options.generate_anonymous_keys);
        let force_offline = options.offline;
        let initial_mode = if force_offline {
            ConnectionMode::SetOffline
        } else {
            ConnectionMode::resolve(
                false,
                platform.is_network_available(),
                !platform.is_foreground(),
                &options,
            )
        };
        let connection =
            ConnectionInformation::from_saved(initial_mode, environment_store.get_connection_info());

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let weak = weak.clone();
            let throttler = Throttler::with_defaults(
                runtime.clone(),
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.update_data_source(false, None);
                    }
                }),
            );
            ManagerInner {
                options: Arc::new(options),
                runtime: runtime.clone(),
                context_data,
                environment_store,
                decorator,
                factory,
                platform,
                event_processor,
                task_executor,
                status_listeners: ListenerRegistry::new(),
                transition_lock: Mutex::new(()),
                current_source: Mutex::new(None),
                connection: Mutex::new(connection),
                platform_listeners: Mutex::new(None),
                throttler,
                save_debounce: Debounce::new(runtime.clone()),
                force_offline: AtomicBool::new(force_offline),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        });

        Ok(Self { inner })
    }

    /// Load cached flags for the current context, subscribe to platform
    /// changes and bring up the data source for the current mode.
    ///
    /// `callback` fires once the data source has started, or immediately
    /// when the mode runs no data source.
    pub fn start(&self, callback: ResultCallback<()>) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            callback(Err(SyncError::closed()));
            return;
        }

        let initial = inner.context_data.current_context();
        let context = inner.decorator.decorate(&initial);
        if context != initial {
            tracing::debug!("Replaced anonymous key of initial context");
            inner.context_data.switch_to_context(&context);
        } else if inner.context_data.init_from_stored_data(&context) {
            tracing::debug!("Loaded cached flags for current context");
        }
        ManagerInner::register_platform_listeners(inner);
        inner.update_data_source(true, Some(callback));
    }

    /// Force the manager offline, or release a previous force.
    pub fn set_force_offline(&self, offline: bool) {
        let inner = &self.inner;
        if inner.force_offline.swap(offline, Ordering::SeqCst) == offline {
            return;
        }
        tracing::debug!(offline, "Force offline changed");
        inner.throttler.cancel();
        inner.update_data_source(false, None);
    }

    pub fn is_force_offline(&self) -> bool {
        self.inner.force_offline.load(Ordering::SeqCst)
    }

    /// Make `context` active and reconnect for it.
    ///
    /// While offline only the cache is switched; the callback completes
    /// without touching any data source.
    pub fn switch_to_context(&self, context: &EvaluationContext, callback: ResultCallback<()>) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            callback(Err(SyncError::closed()));
            return;
        }

        let context = inner.decorator.decorate(context);
        inner.context_data.switch_to_context(&context);

        if inner.force_offline.load(Ordering::SeqCst) || !inner.platform.is_network_available() {
            tracing::debug!("Offline; switched cached context only");
            callback(Ok(()));
            return;
        }
        inner.update_data_source(true, Some(callback));
    }

    pub fn connection_information(&self) -> ConnectionInformation {
        self.inner.connection.lock().clone()
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.inner.connection.lock().connection_mode
    }

    /// Whether the current mode has finished coming up.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Register for mode changes and internal failures. Dropping the handle
    /// unregisters.
    pub fn register_status_listener(&self, listener: Arc<dyn StatusListener>) -> ListenerHandle {
        self.inner.status_listeners.register(listener)
    }

    /// Stop the data source and detach from the platform. Further calls
    /// have no effect.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Shutting down connectivity manager");

        inner.throttler.cancel();
        if let Some((connectivity, foreground)) = inner.platform_listeners.lock().take() {
            inner.platform.remove_connectivity_listener(connectivity);
            inner.platform.remove_foreground_listener(foreground);
        }

        let (source, mode_change) = {
            let _transition = inner.transition_lock.lock();
            let source = inner.current_source.lock().take();
            (source, inner.swap_connection_mode(ConnectionMode::Shutdown))
        };
        if let Some(source) = source {
            source.stop(Box::new(|_| {}));
        }
        if let Some(info) = mode_change {
            inner.notify_mode_changed(info);
        }
        inner.event_processor.set_offline(true);
    }
}

impl Drop for ConnectivityManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ManagerInner {
    fn register_platform_listeners(this: &Arc<Self>) {
        let mut listeners = this.platform_listeners.lock();
        if listeners.is_some() {
            return;
        }

        let weak = Arc::downgrade(this);
        let connectivity = this
            .platform
            .add_connectivity_listener(Arc::new(move |available| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_network_changed(available);
                }
            }));

        let weak = Arc::downgrade(this);
        let foreground = this
            .platform
            .add_foreground_listener(Arc::new(move |foreground| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_foreground_changed(foreground);
                }
            }));

        *listeners = Some((connectivity, foreground));
    }

    fn on_network_changed(self: &Arc<Self>, available: bool) {
        if self.closed.load(Ordering::SeqCst) || self.force_offline.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!(available, "Network availability changed");
        self.throttler.attempt_run();
    }

    fn on_foreground_changed(self: &Arc<Self>, foreground: bool) {
        if self.closed.load(Ordering::SeqCst) || self.force_offline.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!(foreground, "Foreground state changed");
        if foreground {
            self.throttler.attempt_run();
        } else {
            self.throttler.cancel();
            self.update_data_source(false, None);
        }
    }

    /// Recompute the mode and replace the data source if needed.
    ///
    /// The transition lock only covers choosing the mode and swapping the
    /// current source. Anything that can run caller code happens after it
    /// is released and may call back into the manager.
    fn update_data_source(
        self: &Arc<Self>,
        must_reinitialize: bool,
        on_complete: Option<ResultCallback<()>>,
    ) {
        let plan = {
            let _transition = self.transition_lock.lock();
            self.plan_transition(must_reinitialize)
        };

        if let Some((offline, in_background)) = plan.event_state {
            self.event_processor.set_offline(offline);
            self.event_processor.set_in_background(in_background);
        }
        if let Some(info) = plan.mode_change {
            self.notify_mode_changed(info);
        }

        let Some(source) = plan.next else {
            if let Some(previous) = plan.previous {
                previous.stop(Box::new(|_| {}));
            }
            if let Err(err) = &plan.outcome {
                self.record_failure(err);
            }
            complete(on_complete, plan.outcome);
            return;
        };

        let weak = Arc::downgrade(self);
        let start = move || {
            source.start(Box::new(move |result| {
                if let (Some(inner), Ok(true)) = (weak.upgrade(), &result) {
                    inner.initialized.store(true, Ordering::SeqCst);
                }
                complete(on_complete, result.map(|_| ()));
            }));
        };

        match plan.previous {
            Some(previous) => previous.stop(Box::new(move |_| start())),
            None => start(),
        }
    }

    /// Caller holds the transition lock.
    fn plan_transition(self: &Arc<Self>, must_reinitialize: bool) -> TransitionPlan {
        if self.closed.load(Ordering::SeqCst) {
            return TransitionPlan::finished(Ok(()));
        }

        let force_offline = self.force_offline.load(Ordering::SeqCst);
        let network_available = self.platform.is_network_available();
        let in_background = !self.platform.is_foreground();
        let mode =
            ConnectionMode::resolve(force_offline, network_available, in_background, &self.options);

        let mut plan = TransitionPlan::finished(Ok(()));
        plan.event_state = Some((force_offline || !network_available, in_background));

        let context = self.context_data.current_context();
        let mut current = self.current_source.lock();

        if !must_reinitialize && mode.is_connection_active() {
            if let Some(source) = current.as_ref() {
                if !source.needs_refresh(in_background, &context) {
                    tracing::debug!(mode = %mode, "Keeping current data source");
                    plan.mode_change = self.swap_connection_mode(mode);
                    return plan;
                }
            }
        }

        plan.previous = current.take();

        if !mode.is_connection_active() {
            tracing::debug!(mode = %mode, "No data source for mode");
            self.initialized.store(true, Ordering::SeqCst);
            plan.mode_change = self.swap_connection_mode(mode);
            return plan;
        }

        let client_context = ClientContext {
            has_cached_data: self.context_data.get_stored_data(&context).is_some(),
            evaluation_context: context,
            in_background,
            sink: Arc::new(ConnectivitySink {
                manager: Arc::downgrade(self),
            }),
            runtime: self.runtime.clone(),
            options: Arc::clone(&self.options),
        };

        match self.factory.build(&client_context) {
            Ok(source) => {
                *current = Some(Arc::clone(&source));
                tracing::debug!(mode = %mode, "Starting data source");
                self.initialized.store(false, Ordering::SeqCst);
                plan.next = Some(source);
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to create data source");
                plan.outcome = Err(err);
            }
        }
        plan.mode_change = self.swap_connection_mode(mode);
        plan
    }

    /// Store `mode`, returning the new information if it changed.
    fn swap_connection_mode(&self, mode: ConnectionMode) -> Option<ConnectionInformation> {
        let mut connection = self.connection.lock();
        if connection.connection_mode == mode {
            return None;
        }
        connection.connection_mode = mode;
        tracing::debug!(mode = %mode, "Connection mode changed");
        Some(connection.clone())
    }

    fn notify_mode_changed(&self, info: ConnectionInformation) {
        for listener in self.status_listeners.snapshot() {
            let info = info.clone();
            self.task_executor
                .execute_on_main_thread(Box::new(move || listener.on_connection_mode_changed(&info)));
        }
    }

    fn record_success(&self) {
        let saved = {
            let mut connection = self.connection.lock();
            connection.last_successful_connection = Some(now_millis());
            connection.to_saved()
        };
        self.save_connection_info(saved);
    }

    fn record_failure(&self, error: &SyncError) {
        let failure = ConnectionFailure::classify(error);
        let saved = {
            let mut connection = self.connection.lock();
            connection.last_failed_connection = Some(now_millis());
            connection.last_failure = Some(failure.clone());
            connection.to_saved()
        };
        self.save_connection_info(saved);

        for listener in self.status_listeners.snapshot() {
            let failure = failure.clone();
            self.task_executor
                .execute_on_main_thread(Box::new(move || listener.on_internal_failure(&failure)));
        }
    }

    fn save_connection_info(&self, saved: SavedConnectionInfo) {
        let store = self.environment_store.clone();
        self.save_debounce.call(async move {
            store.set_connection_info(&saved);
        });
    }
}

/// Sink handed to data sources; outlives neither the manager nor its data.
struct ConnectivitySink {
    manager: Weak<ManagerInner>,
}

impl DataSourceUpdateSink for ConnectivitySink {
    fn apply(&self, context: &EvaluationContext, change_set: ChangeSet) {
        if let Some(inner) = self.manager.upgrade() {
            inner.context_data.apply(context, change_set);
        }
    }

    fn upsert(&self, context: &EvaluationContext, flag: Flag) -> bool {
        match self.manager.upgrade() {
            Some(inner) => inner.context_data.upsert(context, flag),
            None => false,
        }
    }

    fn set_status(&self, state: DataSourceState, error: Option<SyncError>) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        match (state, error) {
            (DataSourceState::Valid, _) => inner.record_success(),
            (DataSourceState::Interrupted | DataSourceState::Off, Some(err)) => {
                tracing::warn!(state = %state, error = %err, "Data source reported failure");
                inner.record_failure(&err);
            }
            _ => {}
        }
    }

    fn selector(&self) -> Selector {
        match self.manager.upgrade() {
            Some(inner) => inner.context_data.selector(),
            None => Selector::EMPTY,
        }
    }
}

/// Work decided under the transition lock and carried out after it.
struct TransitionPlan {
    previous: Option<Arc<dyn DataSource>>,
    next: Option<Arc<dyn DataSource>>,
    mode_change: Option<ConnectionInformation>,
    /// Offline and background flags for the event processor.
    event_state: Option<(bool, bool)>,
    /// Result for `on_complete` when nothing is started.
    outcome: Result<()>,
}

impl TransitionPlan {
    fn finished(outcome: Result<()>) -> Self {
        Self {
            previous: None,
            next: None,
            mode_change: None,
            event_state: None,
            outcome,
        }
    }
}

fn complete(callback: Option<ResultCallback<()>>, result: Result<()>) {
    if let Some(callback) = callback {
        callback(result);
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
