//! FlagKit sync core lab
//!
//! Verification script that drives the cache, engine and connectivity
//! manager end to end against scripted in-memory sources.
//! Run with: cargo run --bin sdk-lab

use flagkit_sync::core::{
    ConnectionMode, ConnectivityManager, ContextDataManager, MainThreadExecutor,
    PersistentStoreWrapper, SyncOptions,
};
use flagkit_sync::datasource::{DataSource, SourceResult, SyncEngineBuilder};
use flagkit_sync::testing::{
    create_test_client_context_with_sink, MockPlatformState, RecordingEventProcessor,
    RecordingSink, ScriptedInitializer, ScriptedSynchronizer,
};
use flagkit_sync::types::{ChangeSet, EvaluationContext, Flag, FlagValue, Selector};
use flagkit_sync::{AwaitableFuture, SyncError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PASS: &str = "\x1b[32m[PASS]\x1b[0m";
const FAIL: &str = "\x1b[31m[FAIL]\x1b[0m";
const WAIT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    println!("=== FlagKit Sync Core Lab ===\n");

    let mut passed = 0;
    let mut failed = 0;

    macro_rules! check {
        ($ok:expr, $test:expr) => {{
            if $ok {
                println!("{} {}", PASS, $test);
                passed += 1;
            } else {
                println!("{} {}", FAIL, $test);
                failed += 1;
            }
        }};
    }

    // Engine: first initializer fails, second delivers
    println!("Testing synchronization engine...");
    let sink = Arc::new(RecordingSink::new());
    let client_context = create_test_client_context_with_sink(sink.clone());
    let engine = SyncEngineBuilder::new()
        .initializer(ScriptedInitializer::factory(Err(SyncError::network(
            "lab: connection refused",
        ))))
        .initializer(ScriptedInitializer::factory(Ok(SourceResult::ChangeSet(
            ChangeSet::full(vec![Flag::new("lab-bool", true, 1)], Selector::new(1, "lab")),
        ))))
        .build_engine(&client_context);

    let started = AwaitableFuture::new();
    engine.start(started.callback());
    check!(
        matches!(started.wait_timeout(WAIT).await, Ok(true)),
        "Engine falls through to the next initializer"
    );
    check!(
        sink.applied_keys() == vec![vec!["lab-bool".to_string()]],
        "Engine applies only the successful result"
    );

    let stopped = AwaitableFuture::new();
    engine.stop(stopped.callback());
    engine.stop(Box::new(|_| {}));
    check!(
        stopped.wait_timeout(WAIT).await.is_ok(),
        "Engine stop is idempotent"
    );

    // Connectivity manager over a real engine
    println!("\nTesting connectivity manager...");
    let options = SyncOptions::builder("mob-lab-key").max_cached_contexts(1).build();
    let store = PersistentStoreWrapper::in_memory();
    let executor = Arc::new(MainThreadExecutor::new());
    let flags = Arc::new(ContextDataManager::new(
        store.per_environment(&options.mobile_key),
        EvaluationContext::new("lab-user"),
        options.max_cached_contexts,
        executor.clone(),
    ));

    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    let _listener = flags.register_listener("lab-string", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let platform = Arc::new(MockPlatformState::new());
    let events = Arc::new(RecordingEventProcessor::new());
    let factory = SyncEngineBuilder::new()
        .initializer(ScriptedInitializer::factory(Ok(SourceResult::ChangeSet(
            ChangeSet::full(
                vec![
                    Flag::new("lab-string", "Hello Lab", 1),
                    Flag::new("lab-number", 42, 1),
                ],
                Selector::new(1, "lab"),
            ),
        ))))
        .synchronizer(ScriptedSynchronizer::factory(vec![]));

    let manager = match ConnectivityManager::new(
        options,
        store,
        flags.clone(),
        Arc::new(factory),
        platform.clone(),
        events.clone(),
        executor.clone(),
        tokio::runtime::Handle::current(),
    ) {
        Ok(manager) => manager,
        Err(e) => {
            println!("{} Manager creation - {}", FAIL, e);
            print_summary(passed, failed + 1);
            std::process::exit(1);
        }
    };

    let ready = AwaitableFuture::new();
    manager.start(ready.callback());
    check!(ready.wait_timeout(WAIT).await.is_ok(), "start()");
    check!(
        manager.connection_mode() == ConnectionMode::Streaming,
        "Foreground online mode is STREAMING"
    );
    check!(
        flags.get_non_deleted_flag("lab-string").map(|f| f.value)
            == Some(FlagValue::from("Hello Lab")),
        "Flag data reaches the cache"
    );
    check!(
        manager
            .connection_information()
            .last_successful_connection
            .is_some(),
        "Successful connection recorded"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    check!(
        changes.load(Ordering::SeqCst) == 1,
        "Flag listener fired on the main thread"
    );

    // Platform transitions
    println!("\nTesting platform transitions...");
    platform.set_foreground(false);
    check!(
        manager.connection_mode() == ConnectionMode::BackgroundPolling,
        "Backgrounding switches to BACKGROUND_POLLING"
    );
    check!(
        events.is_in_background() == Some(true),
        "Event processor told about background"
    );

    manager.set_force_offline(true);
    check!(
        manager.connection_mode() == ConnectionMode::SetOffline,
        "set_force_offline(true)"
    );
    check!(events.is_offline() == Some(true), "Event processor told offline");

    let switched = AwaitableFuture::new();
    manager.switch_to_context(&EvaluationContext::new("lab-user-2"), switched.callback());
    check!(
        switched.wait_timeout(WAIT).await.is_ok()
            && flags.get_non_deleted_flag("lab-string").is_none(),
        "Offline context switch only swaps the cache"
    );

    // Cleanup
    println!("\nTesting cleanup...");
    manager.shutdown();
    check!(
        manager.connection_mode() == ConnectionMode::Shutdown,
        "shutdown()"
    );
    executor.shutdown();
    check!(true, "Main thread drained");

    print_summary(passed, failed);

    if failed > 0 {
        println!("\n\x1b[31mSome verifications failed!\x1b[0m");
        std::process::exit(1);
    } else {
        println!("\n\x1b[32mAll verifications passed!\x1b[0m");
        std::process::exit(0);
    }
}

fn print_summary(passed: i32, failed: i32) {
    println!("\n{}", "=".repeat(40));
    println!("Results: {} passed, {} failed", passed, failed);
    println!("{}", "=".repeat(40));
}
