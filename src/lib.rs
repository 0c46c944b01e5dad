//! FlagKit sync core
//!
//! Client-side flag synchronization for FlagKit mobile SDKs: a versioned
//! per-context flag cache with bounded persistence, a multi-source sync
//! engine with fallback and recovery, and a connectivity manager that keeps
//! the engine in step with network and foreground state.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use flagkit_sync::core::{
//!     ConnectivityManager, ContextDataManager, MainThreadExecutor, NoOpEventProcessor,
//!     PersistentStoreWrapper, SyncOptions,
//! };
//! use flagkit_sync::datasource::{fetch_fn, PollingInitializer, PollingSynchronizer, SyncEngineBuilder};
//! use flagkit_sync::testing::MockPlatformState;
//! use flagkit_sync::types::{ChangeSet, EvaluationContext, Flag, Selector};
//! use flagkit_sync::utils::AwaitableFuture;
//!
//! #[tokio::main]
//! async fn main() -> flagkit_sync::Result<()> {
//!     let options = SyncOptions::builder("mob-your-key")
//!         .stream(false)
//!         .build();
//!
//!     // Fetch closure standing in for a real transport
//!     let fetch = fetch_fn(|_context: EvaluationContext, _selector: Selector| async {
//!         Ok(ChangeSet::full(vec![Flag::new("dark-mode", true, 1)], Selector::new(1, "v1")))
//!     });
//!     let engine = SyncEngineBuilder::new()
//!         .initializer(PollingInitializer::factory(fetch.clone()))
//!         .synchronizer(PollingSynchronizer::factory(fetch));
//!
//!     let executor = Arc::new(MainThreadExecutor::new());
//!     let store = PersistentStoreWrapper::in_memory();
//!     let flags = Arc::new(ContextDataManager::new(
//!         store.per_environment(&options.mobile_key),
//!         EvaluationContext::new("user-123"),
//!         options.max_cached_contexts,
//!         executor.clone(),
//!     ));
//!     let _listener = flags.register_listener("dark-mode", |key| println!("{} changed", key));
//!
//!     let manager = ConnectivityManager::new(
//!         options,
//!         store,
//!         flags.clone(),
//!         Arc::new(engine),
//!         Arc::new(MockPlatformState::new()),
//!         Arc::new(NoOpEventProcessor),
//!         executor,
//!         tokio::runtime::Handle::current(),
//!     )?;
//!
//!     let started = AwaitableFuture::new();
//!     manager.start(started.callback());
//!     started.wait_timeout(Duration::from_secs(5)).await?;
//!
//!     println!("dark-mode: {:?}", flags.get_non_deleted_flag("dark-mode"));
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod datasource;
pub mod error;
/// Scripted sources, recording sinks and mock platform state. Hosts that
/// supply their own platform layer can build with `default-features = false`.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod utils;

pub use error::{ConnectionFailure, ErrorCode, FailureKind, Result, SyncError};

pub use types::{
    ChangeSet, ChangeSetType, EnvironmentData, EvaluationContext, EvaluationContextBuilder, Flag,
    FlagValue, Selector,
};

pub use core::{
    ConnectionInformation, ConnectionMode, ConnectivityManager, ContextDataManager,
    ListenerHandle, PersistentStoreWrapper, StatusListener, SyncOptions, SyncOptionsBuilder,
};

pub use datasource::{
    DataSource, DataSourceFactory, DataSourceState, DataSourceUpdateSink, SyncEngine,
    SyncEngineBuilder,
};

pub use utils::AwaitableFuture;

/// Crate version.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
