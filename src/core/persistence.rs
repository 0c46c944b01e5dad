//! Namespaced persistence of flag data, the context index, generated keys
//! and connection bookkeeping.
//!
//! The wrapper owns no caching policy; it encodes, decodes and namespaces.
//! Every call to the underlying store goes through one lock, and store
//! failures degrade to "nothing stored" instead of propagating.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::context_index::ContextIndex;
use crate::error::{ConnectionFailure, Result};
use crate::types::EnvironmentData;
use crate::utils::url_safe_hash;

/// Namespace shared by every environment.
pub const GLOBAL_NAMESPACE: &str = "FlagKit";

const ENVIRONMENT_NAMESPACE_PREFIX: &str = "FlagKit_";
const ANON_KEY_PREFIX: &str = "anonKey_";
const INDEX_KEY: &str = "index";
const FLAGS_KEY_PREFIX: &str = "flags_";
const LAST_SUCCESS_KEY: &str = "lastSuccessfulConnection";
const LAST_FAILED_KEY: &str = "lastFailedConnection";
const LAST_FAILURE_KEY: &str = "lastFailure";

/// Raw key/value storage supplied by the host.
///
/// Implementations may fail on any call; callers never see those failures
/// directly.
pub trait PersistentStore: Send + Sync {
    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    /// Store `value`, or remove the key when `value` is `None`.
    fn set_value(&self, namespace: &str, key: &str, value: Option<&str>) -> Result<()>;

    /// Apply several updates to one namespace at once.
    fn set_values(&self, namespace: &str, values: &HashMap<String, Option<String>>)
        -> Result<()>;

    fn clear(&self, namespace: &str) -> Result<()>;
}

/// Volatile store used when the host provides no storage, and in tests.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored in `namespace`.
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        self.data
            .lock()
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl PersistentStore for InMemoryStore {
    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .data
            .lock()
            .get(namespace)
            .and_then(|ns| ns.get(key).cloned()))
    }

    fn set_value(&self, namespace: &str, key: &str, value: Option<&str>) -> Result<()> {
        let mut data = self.data.lock();
        let ns = data.entry(namespace.to_string()).or_default();
        match value {
            Some(v) => {
                ns.insert(key.to_string(), v.to_string());
            }
            None => {
                ns.remove(key);
            }
        }
        Ok(())
    }

    fn set_values(
        &self,
        namespace: &str,
        values: &HashMap<String, Option<String>>,
    ) -> Result<()> {
        let mut data = self.data.lock();
        let ns = data.entry(namespace.to_string()).or_default();
        for (key, value) in values {
            match value {
                Some(v) => {
                    ns.insert(key.clone(), v.clone());
                }
                None => {
                    ns.remove(key);
                }
            }
        }
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        self.data.lock().remove(namespace);
        Ok(())
    }
}

/// Connection timestamps and last failure as persisted per environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedConnectionInfo {
    pub last_success_time: Option<i64>,
    pub last_failure_time: Option<i64>,
    pub last_failure: Option<ConnectionFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StoreOperation {
    Read,
    Write,
    Clear,
}

impl StoreOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Read => "read",
            StoreOperation::Write => "write",
            StoreOperation::Clear => "clear",
        }
    }
}

struct WrapperInner {
    store: Arc<dyn PersistentStore>,
    store_lock: Mutex<()>,
    generated_keys: Mutex<HashMap<String, String>>,
    /// Operations whose failure has already been logged at warn.
    failed_operations: Mutex<HashSet<StoreOperation>>,
}

impl WrapperInner {
    /// Returns `true` when this was the first failure of `operation`.
    fn log_store_error(&self, operation: StoreOperation, err: &crate::error::SyncError) -> bool {
        let first = self.failed_operations.lock().insert(operation);
        if first {
            tracing::warn!(
                "Persistent store {} failed, continuing without cached data: {}",
                operation.as_str(),
                err
            );
        } else {
            tracing::debug!("Persistent store {} failed: {}", operation.as_str(), err);
        }
        first
    }

    fn get(&self, namespace: &str, key: &str) -> Option<String> {
        let _guard = self.store_lock.lock();
        match self.store.get_value(namespace, key) {
            Ok(value) => value,
            Err(e) => {
                self.log_store_error(StoreOperation::Read, &e);
                None
            }
        }
    }

    fn set(&self, namespace: &str, key: &str, value: Option<&str>) {
        let _guard = self.store_lock.lock();
        if let Err(e) = self.store.set_value(namespace, key, value) {
            self.log_store_error(StoreOperation::Write, &e);
        }
    }

    fn set_many(&self, namespace: &str, values: &HashMap<String, Option<String>>) {
        let _guard = self.store_lock.lock();
        if let Err(e) = self.store.set_values(namespace, values) {
            self.log_store_error(StoreOperation::Write, &e);
        }
    }

    fn clear(&self, namespace: &str) {
        let _guard = self.store_lock.lock();
        if let Err(e) = self.store.clear(namespace) {
            self.log_store_error(StoreOperation::Clear, &e);
        }
    }
}

/// Typed access to the host's persistent store.
#[derive(Clone)]
pub struct PersistentStoreWrapper {
    inner: Arc<WrapperInner>,
}

impl PersistentStoreWrapper {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            inner: Arc::new(WrapperInner {
                store,
                store_lock: Mutex::new(()),
                generated_keys: Mutex::new(HashMap::new()),
                failed_operations: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Wrapper over volatile storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// Stable generated key for anonymous contexts of `kind`.
    ///
    /// Cached for the process lifetime and persisted when storage allows,
    /// so the same key survives restarts.
    pub fn get_or_generate_context_key(&self, kind: &str) -> String {
        let mut cache = self.inner.generated_keys.lock();
        if let Some(key) = cache.get(kind) {
            return key.clone();
        }

        let store_key = format!("{}{}", ANON_KEY_PREFIX, kind);
        let key = match self.inner.get(GLOBAL_NAMESPACE, &store_key) {
            Some(key) => key,
            None => {
                let key = uuid::Uuid::new_v4().to_string();
                tracing::info!(
                    "Did not find a generated key for context kind \"{}\"; generated a new one",
                    kind
                );
                self.inner.set(GLOBAL_NAMESPACE, &store_key, Some(&key));
                key
            }
        };
        cache.insert(kind.to_string(), key.clone());
        key
    }

    /// Accessor for one environment's data, selected by its mobile key.
    pub fn per_environment(&self, mobile_key: &str) -> PerEnvironmentData {
        PerEnvironmentData {
            inner: Arc::clone(&self.inner),
            namespace: format!("{}{}", ENVIRONMENT_NAMESPACE_PREFIX, url_safe_hash(mobile_key)),
        }
    }

    /// Forget all generated keys, in memory and in storage.
    pub fn clear_global(&self) {
        self.inner.generated_keys.lock().clear();
        self.inner.clear(GLOBAL_NAMESPACE);
    }
}

/// Persistence scoped to a single environment.
#[derive(Clone)]
pub struct PerEnvironmentData {
    inner: Arc<WrapperInner>,
    namespace: String,
}

impl PerEnvironmentData {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cached flags for the context with hash `context_id`.
    pub fn get_context_data(&self, context_id: &str) -> Option<EnvironmentData> {
        let json = self.inner.get(&self.namespace, &flags_key(context_id))?;
        match EnvironmentData::from_json(&json) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!("Discarding unreadable cached flag data: {}", e);
                None
            }
        }
    }

    pub fn set_context_data(&self, context_id: &str, data: &EnvironmentData) {
        match data.to_json() {
            Ok(json) => self
                .inner
                .set(&self.namespace, &flags_key(context_id), Some(&json)),
            Err(e) => tracing::warn!("Failed to encode flag data: {}", e),
        }
    }

    pub fn remove_context_data(&self, context_id: &str) {
        self.inner.set(&self.namespace, &flags_key(context_id), None);
    }

    /// The stored index, or an empty one if absent or unreadable.
    pub fn get_index(&self) -> ContextIndex {
        let Some(json) = self.inner.get(&self.namespace, INDEX_KEY) else {
            return ContextIndex::new();
        };
        ContextIndex::from_json(&json).unwrap_or_else(|e| {
            tracing::warn!("Discarding unreadable context index: {}", e);
            ContextIndex::new()
        })
    }

    pub fn set_index(&self, index: &ContextIndex) {
        match index.to_json() {
            Ok(json) => self.inner.set(&self.namespace, INDEX_KEY, Some(&json)),
            Err(e) => tracing::warn!("Failed to encode context index: {}", e),
        }
    }

    pub fn get_connection_info(&self) -> SavedConnectionInfo {
        let parse_time = |key: &str| {
            self.inner
                .get(&self.namespace, key)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|t| *t != 0)
        };
        let last_failure = self
            .inner
            .get(&self.namespace, LAST_FAILURE_KEY)
            .and_then(|json| serde_json::from_str::<ConnectionFailure>(&json).ok());

        SavedConnectionInfo {
            last_success_time: parse_time(LAST_SUCCESS_KEY),
            last_failure_time: parse_time(LAST_FAILED_KEY),
            last_failure,
        }
    }

    pub fn set_connection_info(&self, info: &SavedConnectionInfo) {
        let mut values = HashMap::new();
        values.insert(
            LAST_SUCCESS_KEY.to_string(),
            info.last_success_time.map(|t| t.to_string()),
        );
        values.insert(
            LAST_FAILED_KEY.to_string(),
            info.last_failure_time.map(|t| t.to_string()),
        );
        values.insert(
            LAST_FAILURE_KEY.to_string(),
            info.last_failure
                .as_ref()
                .and_then(|f| serde_json::to_string(f).ok()),
        );
        self.inner.set_many(&self.namespace, &values);
    }

    /// Remove everything stored for this environment.
    pub fn clear(&self) {
        self.inner.clear(&self.namespace);
    }
}

fn flags_key(context_id: &str) -> String {
    format!("{}{}", FLAGS_KEY_PREFIX, context_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, FailureKind, SyncError};
    use crate::types::Flag;

    struct FailingStore;

    impl PersistentStore for FailingStore {
        fn get_value(&self, _: &str, _: &str) -> Result<Option<String>> {
            Err(SyncError::new(ErrorCode::StoreReadError, "unavailable"))
        }

        fn set_value(&self, _: &str, _: &str, _: Option<&str>) -> Result<()> {
            Err(SyncError::new(ErrorCode::StoreWriteError, "unavailable"))
        }

        fn set_values(&self, _: &str, _: &HashMap<String, Option<String>>) -> Result<()> {
            Err(SyncError::new(ErrorCode::StoreWriteError, "unavailable"))
        }

        fn clear(&self, _: &str) -> Result<()> {
            Err(SyncError::new(ErrorCode::StoreWriteError, "unavailable"))
        }
    }

    #[test]
    fn test_context_data_round_trip() {
        let env = PersistentStoreWrapper::in_memory().per_environment("mob-key");
        let data: EnvironmentData = vec![Flag::new("a", true, 1)].into_iter().collect();

        assert!(env.get_context_data("ctx").is_none());
        env.set_context_data("ctx", &data);
        assert_eq!(env.get_context_data("ctx"), Some(data));
        env.remove_context_data("ctx");
        assert!(env.get_context_data("ctx").is_none());
    }

    #[test]
    fn test_environment_namespace_uses_hashed_key() {
        let env = PersistentStoreWrapper::in_memory().per_environment("mob-key");
        assert_eq!(
            env.namespace(),
            format!("FlagKit_{}", url_safe_hash("mob-key"))
        );
    }

    #[test]
    fn test_environments_are_isolated() {
        let wrapper = PersistentStoreWrapper::in_memory();
        let env1 = wrapper.per_environment("key1");
        let env2 = wrapper.per_environment("key2");
        let data: EnvironmentData = vec![Flag::new("a", true, 1)].into_iter().collect();

        env1.set_context_data("ctx", &data);
        assert!(env2.get_context_data("ctx").is_none());
    }

    #[test]
    fn test_generated_key_is_stable_and_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let wrapper = PersistentStoreWrapper::new(store.clone());
        let key = wrapper.get_or_generate_context_key("user");
        assert_eq!(wrapper.get_or_generate_context_key("user"), key);
        assert_ne!(wrapper.get_or_generate_context_key("org"), key);

        // A new wrapper over the same store sees the persisted key
        let restarted = PersistentStoreWrapper::new(store.clone());
        assert_eq!(restarted.get_or_generate_context_key("user"), key);
        assert_eq!(
            store.get_value(GLOBAL_NAMESPACE, "anonKey_user").unwrap(),
            Some(key)
        );
    }

    #[test]
    fn test_generated_key_stable_without_working_store() {
        let wrapper = PersistentStoreWrapper::new(Arc::new(FailingStore));
        let key = wrapper.get_or_generate_context_key("user");
        assert_eq!(wrapper.get_or_generate_context_key("user"), key);
        assert!(uuid::Uuid::parse_str(&key).is_ok());
    }

    #[test]
    fn test_store_failures_degrade() {
        let env = PersistentStoreWrapper::new(Arc::new(FailingStore)).per_environment("k");
        env.set_context_data("ctx", &EnvironmentData::new());
        assert!(env.get_context_data("ctx").is_none());
        assert!(env.get_index().is_empty());
        assert_eq!(env.get_connection_info(), SavedConnectionInfo::default());
    }

    #[test]
    fn test_first_failure_of_each_operation_is_reported() {
        let wrapper = PersistentStoreWrapper::new(Arc::new(FailingStore));
        let env = wrapper.per_environment("k");
        let inner = &wrapper.inner;

        assert!(env.get_context_data("ctx").is_none());
        env.set_context_data("ctx", &EnvironmentData::new());
        env.clear();
        assert_eq!(inner.failed_operations.lock().len(), 3);

        let err = SyncError::new(ErrorCode::StoreReadError, "unavailable");
        assert!(!inner.log_store_error(StoreOperation::Read, &err));
        assert!(!inner.log_store_error(StoreOperation::Write, &err));
        assert!(!inner.log_store_error(StoreOperation::Clear, &err));
    }

    #[test]
    fn test_malformed_index_reads_as_empty() {
        let store = Arc::new(InMemoryStore::new());
        let env = PersistentStoreWrapper::new(store.clone()).per_environment("k");
        store
            .set_value(env.namespace(), "index", Some("[[\"a\"]]"))
            .unwrap();
        assert!(env.get_index().is_empty());
    }

    #[test]
    fn test_connection_info_round_trip() {
        let env = PersistentStoreWrapper::in_memory().per_environment("k");
        let info = SavedConnectionInfo {
            last_success_time: Some(1000),
            last_failure_time: Some(2000),
            last_failure: Some(ConnectionFailure::new(
                FailureKind::unexpected_response(503),
                "server unavailable",
            )),
        };
        env.set_connection_info(&info);
        assert_eq!(env.get_connection_info(), info);

        env.set_connection_info(&SavedConnectionInfo::default());
        assert_eq!(env.get_connection_info(), SavedConnectionInfo::default());
    }
}
