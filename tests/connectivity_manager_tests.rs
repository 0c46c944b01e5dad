use flagkit_sync::core::{
    ConnectionInformation, ConnectionMode, ConnectivityManager, ContextDataManager,
    InlineExecutor, PersistentStoreWrapper, StatusListener, SyncOptions,
};
use flagkit_sync::datasource::DataSourceState;
use flagkit_sync::error::{ConnectionFailure, ErrorCode, FailureKind, SyncError};
use flagkit_sync::testing::{
    MockPlatformState, RecordingDataSourceFactory, RecordingEventProcessor, TEST_MOBILE_KEY,
};
use flagkit_sync::types::{EvaluationContext, Flag, FlagValue};
use flagkit_sync::utils::AwaitableFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    manager: Arc<ConnectivityManager>,
    platform: Arc<MockPlatformState>,
    events: Arc<RecordingEventProcessor>,
    factory: Arc<RecordingDataSourceFactory>,
    flags: Arc<ContextDataManager>,
    store: PersistentStoreWrapper,
}

fn create_test_harness(options: SyncOptions, factory: RecordingDataSourceFactory) -> Harness {
    create_test_harness_with_store(
        options,
        factory,
        PersistentStoreWrapper::in_memory(),
        MockPlatformState::new(),
    )
}

fn create_test_harness_with_store(
    options: SyncOptions,
    factory: RecordingDataSourceFactory,
    store: PersistentStoreWrapper,
    platform: MockPlatformState,
) -> Harness {
    create_test_harness_for_context(
        options,
        factory,
        store,
        platform,
        EvaluationContext::new("user-1"),
    )
}

fn create_test_harness_for_context(
    options: SyncOptions,
    factory: RecordingDataSourceFactory,
    store: PersistentStoreWrapper,
    platform: MockPlatformState,
    initial_context: EvaluationContext,
) -> Harness {
    init_tracing();
    let platform = Arc::new(platform);
    let events = Arc::new(RecordingEventProcessor::new());
    let factory = Arc::new(factory);
    let flags = Arc::new(ContextDataManager::new(
        store.per_environment(&options.mobile_key),
        initial_context,
        options.max_cached_contexts,
        Arc::new(InlineExecutor),
    ));
    let manager = ConnectivityManager::new(
        options,
        store.clone(),
        flags.clone(),
        factory.clone(),
        platform.clone(),
        events.clone(),
        Arc::new(InlineExecutor),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    Harness {
        manager: Arc::new(manager),
        platform,
        events,
        factory,
        flags,
        store,
    }
}

fn default_options() -> SyncOptions {
    SyncOptions::new(TEST_MOBILE_KEY)
}

async fn start(manager: &ConnectivityManager) -> flagkit_sync::Result<()> {
    let done = AwaitableFuture::new();
    manager.start(done.callback());
    done.wait_timeout(WAIT).await
}

async fn switch(manager: &ConnectivityManager, context: &EvaluationContext) {
    let done = AwaitableFuture::new();
    manager.switch_to_context(context, done.callback());
    done.wait_timeout(WAIT).await.unwrap();
}

#[derive(Default)]
struct RecordingStatusListener {
    modes: Mutex<Vec<ConnectionMode>>,
    failures: Mutex<Vec<ConnectionFailure>>,
}

impl StatusListener for RecordingStatusListener {
    fn on_connection_mode_changed(&self, info: &ConnectionInformation) {
        self.modes.lock().push(info.connection_mode);
    }

    fn on_internal_failure(&self, failure: &ConnectionFailure) {
        self.failures.lock().push(failure.clone());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_online_foreground_streams() {
    let h = create_test_harness(
        default_options(),
        RecordingDataSourceFactory::with_flags(vec![Flag::new("flag", "on", 1)]),
    );
    start(&h.manager).await.unwrap();

    assert_eq!(h.manager.connection_mode(), ConnectionMode::Streaming);
    assert!(h.manager.is_initialized());
    assert_eq!(h.factory.build_count(), 1);
    let source = h.factory.last().unwrap();
    assert!(source.is_started());
    assert!(!source.in_background());
    assert_eq!(h.events.is_offline(), Some(false));
    assert_eq!(h.events.is_in_background(), Some(false));
    assert_eq!(
        h.flags.get_non_deleted_flag("flag").map(|f| f.value),
        Some(FlagValue::from("on"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_polling_mode_when_streaming_disabled() {
    let options = SyncOptions::builder(TEST_MOBILE_KEY).stream(false).build();
    let h = create_test_harness(options, RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();
    assert_eq!(h.manager.connection_mode(), ConnectionMode::Polling);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_forced_offline_builds_nothing() {
    let options = SyncOptions::builder(TEST_MOBILE_KEY).offline(true).build();
    let h = create_test_harness(options, RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();

    assert!(h.manager.is_force_offline());
    assert_eq!(h.manager.connection_mode(), ConnectionMode::SetOffline);
    assert_eq!(h.factory.build_count(), 0);
    assert_eq!(h.events.is_offline(), Some(true));
    assert!(h.manager.is_initialized());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_without_network_is_offline() {
    let platform = MockPlatformState::new();
    platform.set_network_available(false);
    let h = create_test_harness_with_store(
        default_options(),
        RecordingDataSourceFactory::new(),
        PersistentStoreWrapper::in_memory(),
        platform,
    );
    start(&h.manager).await.unwrap();

    assert_eq!(h.manager.connection_mode(), ConnectionMode::Offline);
    assert_eq!(h.factory.build_count(), 0);
    assert_eq!(h.events.is_offline(), Some(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_background_modes() {
    let platform = MockPlatformState::new();
    platform.set_foreground(false);
    let h = create_test_harness_with_store(
        default_options(),
        RecordingDataSourceFactory::new(),
        PersistentStoreWrapper::in_memory(),
        platform,
    );
    start(&h.manager).await.unwrap();
    assert_eq!(h.manager.connection_mode(), ConnectionMode::BackgroundPolling);
    assert!(h.factory.last().unwrap().in_background());
    assert_eq!(h.events.is_in_background(), Some(true));

    let platform = MockPlatformState::new();
    platform.set_foreground(false);
    let options = SyncOptions::builder(TEST_MOBILE_KEY)
        .disable_background_updating(true)
        .build();
    let h = create_test_harness_with_store(
        options,
        RecordingDataSourceFactory::new(),
        PersistentStoreWrapper::in_memory(),
        platform,
    );
    start(&h.manager).await.unwrap();
    assert_eq!(h.manager.connection_mode(), ConnectionMode::BackgroundDisabled);
    assert_eq!(h.factory.build_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_network_loss_stops_source() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();
    let first = h.factory.last().unwrap();

    h.platform.set_network_available(false);
    assert_eq!(h.manager.connection_mode(), ConnectionMode::Offline);
    assert!(first.is_stopped());
    assert_eq!(h.events.is_offline(), Some(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unchanged_state_keeps_source() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();

    h.platform.set_network_available(true);
    assert_eq!(h.factory.build_count(), 1);
    assert!(!h.factory.last().unwrap().is_stopped());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_backgrounding_rebuilds_source() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();
    let foreground = h.factory.last().unwrap();

    h.platform.set_foreground(false);
    assert_eq!(h.manager.connection_mode(), ConnectionMode::BackgroundPolling);
    assert!(foreground.is_stopped());
    let background = h.factory.last().unwrap();
    assert!(background.in_background());
    assert!(background.is_started());
    assert_eq!(h.factory.build_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_force_offline_round_trip() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();
    let first = h.factory.last().unwrap();

    h.manager.set_force_offline(true);
    assert_eq!(h.manager.connection_mode(), ConnectionMode::SetOffline);
    assert!(first.is_stopped());

    // Platform changes are ignored while forced offline.
    h.platform.set_foreground(false);
    assert_eq!(h.manager.connection_mode(), ConnectionMode::SetOffline);
    h.platform.set_foreground(true);

    h.manager.set_force_offline(false);
    assert_eq!(h.manager.connection_mode(), ConnectionMode::Streaming);
    assert_eq!(h.factory.build_count(), 2);
    assert!(h.factory.last().unwrap().is_started());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_switch_context_rebuilds_source() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();
    let first = h.factory.last().unwrap();

    let next = EvaluationContext::new("user-2");
    switch(&h.manager, &next).await;

    assert!(first.is_stopped());
    assert_eq!(h.factory.build_count(), 2);
    assert_eq!(h.factory.last().unwrap().context(), &next);
    assert_eq!(h.flags.current_context(), next);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_switch_context_offline_updates_cache_only() {
    let options = SyncOptions::builder(TEST_MOBILE_KEY).offline(true).build();
    let h = create_test_harness(options, RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();

    let next = EvaluationContext::new("user-2");
    switch(&h.manager, &next).await;
    assert_eq!(h.factory.build_count(), 0);
    assert_eq!(h.flags.current_context(), next);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_anonymous_context_gets_generated_key() {
    let options = SyncOptions::builder(TEST_MOBILE_KEY)
        .generate_anonymous_keys(true)
        .build();
    let h = create_test_harness(options, RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();

    switch(&h.manager, &EvaluationContext::new("placeholder").anonymous(true)).await;
    let source = h.factory.last().unwrap();
    assert_ne!(source.context().key, "placeholder");
    assert_eq!(source.context().key, h.store.get_or_generate_context_key("user"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_anonymous_initial_context_gets_generated_key() {
    let options = SyncOptions::builder(TEST_MOBILE_KEY)
        .generate_anonymous_keys(true)
        .build();
    let h = create_test_harness_for_context(
        options,
        RecordingDataSourceFactory::new(),
        PersistentStoreWrapper::in_memory(),
        MockPlatformState::new(),
        EvaluationContext::new("placeholder").anonymous(true),
    );
    start(&h.manager).await.unwrap();

    let generated = h.store.get_or_generate_context_key("user");
    assert_eq!(h.flags.current_context().key, generated);
    assert_eq!(h.factory.last().unwrap().context().key, generated);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_callback_may_reenter_manager() {
    let options = SyncOptions::builder(TEST_MOBILE_KEY).offline(true).build();
    let h = create_test_harness(options, RecordingDataSourceFactory::new());

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let manager = h.manager.clone();
    let runtime = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        let _guard = runtime.enter();
        let callback_manager = manager.clone();
        manager.start(Box::new(move |_| {
            callback_manager.set_force_offline(false);
        }));
        let _ = done_tx.send(());
    });

    let returned = tokio::task::spawn_blocking(move || done_rx.recv_timeout(WAIT).is_ok())
        .await
        .unwrap();
    assert!(returned);
    assert!(!h.manager.is_force_offline());
    assert_eq!(h.manager.connection_mode(), ConnectionMode::Streaming);
    assert_eq!(h.factory.build_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_information_tracks_outcomes() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();

    let info = h.manager.connection_information();
    assert!(info.last_successful_connection.is_some());
    assert!(info.last_failure.is_none());

    let source = h.factory.last().unwrap();
    source.report(
        DataSourceState::Interrupted,
        Some(SyncError::unexpected_response(503)),
    );

    let info = h.manager.connection_information();
    assert!(info.last_successful_connection.is_some());
    assert!(info.last_failed_connection.is_some());
    let failure = info.last_failure.unwrap();
    assert_eq!(failure.kind, FailureKind::unexpected_response(503));
    assert!(failure.is_retryable());

    source.report(DataSourceState::Interrupted, Some(SyncError::network("reset")));
    assert_eq!(
        h.manager.connection_information().last_failure.map(|f| f.kind),
        Some(FailureKind::NetworkFailure)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_information_is_persisted() {
    let store = PersistentStoreWrapper::in_memory();
    let h = create_test_harness_with_store(
        default_options(),
        RecordingDataSourceFactory::new(),
        store.clone(),
        MockPlatformState::new(),
    );
    start(&h.manager).await.unwrap();
    h.factory
        .last()
        .unwrap()
        .report(DataSourceState::Off, Some(SyncError::network("gone")));

    let environment = store.per_environment(TEST_MOBILE_KEY);
    let mut saved = environment.get_connection_info();
    for _ in 0..100 {
        if saved.last_failure.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        saved = environment.get_connection_info();
    }
    assert_eq!(
        saved.last_failure.map(|f| f.kind),
        Some(FailureKind::NetworkFailure)
    );
    assert!(saved.last_success_time.is_some());

    let restored = create_test_harness_with_store(
        default_options(),
        RecordingDataSourceFactory::new(),
        store,
        MockPlatformState::new(),
    );
    let info = restored.manager.connection_information();
    assert_eq!(
        info.last_failure.map(|f| f.kind),
        Some(FailureKind::NetworkFailure)
    );
    assert!(info.last_failed_connection.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_listener_notifications() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    let listener = Arc::new(RecordingStatusListener::default());
    let handle = h.manager.register_status_listener(listener.clone());

    start(&h.manager).await.unwrap();
    h.manager.set_force_offline(true);
    h.factory
        .last()
        .unwrap()
        .report(DataSourceState::Interrupted, Some(SyncError::network("late")));

    assert_eq!(*listener.modes.lock(), vec![ConnectionMode::SetOffline]);
    assert_eq!(listener.failures.lock().len(), 1);

    drop(handle);
    h.manager.set_force_offline(false);
    assert_eq!(listener.modes.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_factory_failure_is_reported() {
    let h = create_test_harness(
        default_options(),
        RecordingDataSourceFactory::failing(SyncError::config_error("no transport")),
    );
    let err = start(&h.manager).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ConfigInvalid);
    assert_eq!(
        h.manager.connection_information().last_failure.map(|f| f.kind),
        Some(FailureKind::UnknownError)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_releases_everything() {
    let h = create_test_harness(default_options(), RecordingDataSourceFactory::new());
    start(&h.manager).await.unwrap();
    assert_eq!(h.platform.listener_count(), 2);

    h.manager.shutdown();
    h.manager.shutdown();

    assert_eq!(h.manager.connection_mode(), ConnectionMode::Shutdown);
    assert!(h.factory.last().unwrap().is_stopped());
    assert_eq!(h.platform.listener_count(), 0);
    assert_eq!(h.events.is_offline(), Some(true));

    let err = start(&h.manager).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ManagerClosed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_options_rejected() {
    let result = ConnectivityManager::new(
        SyncOptions::new(""),
        PersistentStoreWrapper::in_memory(),
        Arc::new(ContextDataManager::new(
            PersistentStoreWrapper::in_memory().per_environment("x"),
            EvaluationContext::new("u"),
            5,
            Arc::new(InlineExecutor),
        )),
        Arc::new(RecordingDataSourceFactory::new()),
        Arc::new(MockPlatformState::new()),
        Arc::new(RecordingEventProcessor::new()),
        Arc::new(InlineExecutor),
        tokio::runtime::Handle::current(),
    );
    assert_eq!(result.err().map(|e| e.code), Some(ErrorCode::ConfigInvalid));
}
