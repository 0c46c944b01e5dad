mod config;
mod connectivity_manager;
mod context_data_manager;
mod context_decorator;
mod context_index;
mod file_store;
mod listeners;
mod persistence;
mod platform;
mod task_executor;

pub use config::{
    SyncOptions, SyncOptionsBuilder, DEFAULT_BACKGROUND_POLLING_INTERVAL,
    DEFAULT_FALLBACK_TIMEOUT, DEFAULT_MAX_CACHED_CONTEXTS, DEFAULT_POLLING_INTERVAL,
    DEFAULT_RECOVERY_TIMEOUT, MIN_BACKGROUND_POLLING_INTERVAL,
};
pub use connectivity_manager::{
    ConnectionInformation, ConnectionMode, ConnectivityManager, StatusListener,
};
pub use context_data_manager::ContextDataManager;
pub use context_decorator::ContextDecorator;
pub use context_index::{ContextIndex, IndexEntry};
pub use file_store::{FileStore, FileStoreConfig};
pub use listeners::{
    AllFlagsListener, FlagChangeListener, KeyedListenerRegistry, ListenerHandle,
    ListenerRegistry,
};
pub use persistence::{
    InMemoryStore, PerEnvironmentData, PersistentStore, PersistentStoreWrapper,
    SavedConnectionInfo, GLOBAL_NAMESPACE,
};
pub use platform::{EventProcessor, ListenerId, NoOpEventProcessor, PlatformListener, PlatformState};
pub use task_executor::{InlineExecutor, MainThreadExecutor, Task, TaskExecutor, MAIN_THREAD_NAME};
