//! Flag cache for the active evaluation context.
//!
//! The manager is the only mutator of in-memory flag data. It merges change
//! sets under the version rule, writes through to the per-environment store,
//! keeps the cached-context index bounded, and fans changes out to
//! listeners on the task executor's thread.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::listeners::{
    AllFlagsListener, FlagChangeListener, KeyedListenerRegistry, ListenerHandle, ListenerRegistry,
};
use super::persistence::PerEnvironmentData;
use super::task_executor::TaskExecutor;
use crate::types::{ChangeSet, ChangeSetType, EnvironmentData, EvaluationContext, Flag, Selector};
use crate::utils::url_safe_hash;

struct CacheState {
    current_context: EvaluationContext,
    context_id: String,
    flags: EnvironmentData,
    selector: Selector,
}

/// Keys touched by one update, split by what listeners may see.
#[derive(Debug, Default)]
struct FlagChanges {
    /// Created or updated to a visible value.
    visible: BTreeSet<String>,
    /// Every affected key, deletions included.
    all: BTreeSet<String>,
}

impl FlagChanges {
    fn record(&mut self, flag: &Flag) {
        if !flag.is_deleted() {
            self.visible.insert(flag.key.clone());
        }
        self.all.insert(flag.key.clone());
    }

    fn record_removed(&mut self, key: &str) {
        self.all.insert(key.to_string());
    }

    fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Authoritative flag data for the current context.
///
/// # Thread Safety
///
/// Reads take a shared lock on the in-memory state. Mutations are
/// serialized by a separate writer lock that is held across the matching
/// persistence writes, so the store never sees two updates interleave.
/// Listeners are dispatched after the writer lock is released and may call
/// back into the manager.
///
/// # Example
///
/// ```rust
/// use flagkit_sync::core::{ContextDataManager, InlineExecutor, PersistentStoreWrapper};
/// use flagkit_sync::types::{ChangeSet, EvaluationContext, Flag, Selector};
/// use std::sync::Arc;
///
/// let store = PersistentStoreWrapper::in_memory().per_environment("mob-key");
/// let context = EvaluationContext::new("user-1");
/// let manager = ContextDataManager::new(store, context.clone(), 5, Arc::new(InlineExecutor));
///
/// manager.apply(&context, ChangeSet::full(vec![Flag::new("dark-mode", true, 1)], Selector::EMPTY));
/// assert!(manager.get_non_deleted_flag("dark-mode").is_some());
/// ```
pub struct ContextDataManager {
    environment_store: PerEnvironmentData,
    max_cached_contexts: i32,
    task_executor: Arc<dyn TaskExecutor>,
    flag_listeners: KeyedListenerRegistry<FlagChangeListener>,
    all_flags_listeners: ListenerRegistry<AllFlagsListener>,
    state: RwLock<CacheState>,
    writer_lock: Mutex<()>,
}

impl ContextDataManager {
    /// Create a manager whose active context is `initial_context`, with no
    /// flag data loaded yet.
    ///
    /// `max_cached_contexts` counts contexts kept besides the active one;
    /// a negative value disables eviction.
    pub fn new(
        environment_store: PerEnvironmentData,
        initial_context: EvaluationContext,
        max_cached_contexts: i32,
        task_executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let context_id = Self::hashed_context_id(&initial_context);
        Self {
            environment_store,
            max_cached_contexts,
            task_executor,
            flag_listeners: KeyedListenerRegistry::new(),
            all_flags_listeners: ListenerRegistry::new(),
            state: RwLock::new(CacheState {
                current_context: initial_context,
                context_id,
                flags: EnvironmentData::new(),
                selector: Selector::EMPTY,
            }),
            writer_lock: Mutex::new(()),
        }
    }

    /// Storage key for a context's flag data.
    pub fn hashed_context_id(context: &EvaluationContext) -> String {
        url_safe_hash(&context.fully_qualified_key())
    }

    pub fn current_context(&self) -> EvaluationContext {
        self.state.read().current_context.clone()
    }

    /// Make `context` active, loading its cached data or starting empty.
    ///
    /// The context becomes the most recently used index entry. Data for
    /// contexts pruned out of the index is deleted.
    pub fn switch_to_context(&self, context: &EvaluationContext) {
        let writer = self.writer_lock.lock();
        let context_id = Self::hashed_context_id(context);
        let data = self
            .environment_store
            .get_context_data(&context_id)
            .unwrap_or_default();
        tracing::debug!(
            "Switching to context {}, {} cached flags",
            context_id,
            data.len()
        );
        let changes = self.init_data_locked(context, data, false);
        drop(writer);
        self.notify(changes);
    }

    /// Replace all data for `context` and persist it.
    pub fn init_data(&self, context: &EvaluationContext, data: EnvironmentData) {
        let writer = self.writer_lock.lock();
        let changes = self.init_data_locked(context, data, true);
        drop(writer);
        self.notify(changes);
    }

    /// Load cached data for `context` if any exists.
    ///
    /// Returns `false`, leaving the current state untouched, when nothing
    /// is cached.
    pub fn init_from_stored_data(&self, context: &EvaluationContext) -> bool {
        let writer = self.writer_lock.lock();
        match self
            .environment_store
            .get_context_data(&Self::hashed_context_id(context))
        {
            Some(data) => {
                let changes = self.init_data_locked(context, data, false);
                drop(writer);
                self.notify(changes);
                true
            }
            None => false,
        }
    }

    /// Cached data for `context`, tombstones included.
    pub fn get_stored_data(&self, context: &EvaluationContext) -> Option<EnvironmentData> {
        self.environment_store
            .get_context_data(&Self::hashed_context_id(context))
    }

    /// Apply a change set addressed to `context`.
    ///
    /// Change sets for any context other than the active one are dropped.
    pub fn apply(&self, context: &EvaluationContext, change_set: ChangeSet) {
        let writer = self.writer_lock.lock();
        let context_id = Self::hashed_context_id(context);
        if context_id != self.state.read().context_id {
            tracing::debug!(
                "Dropping {:?} change set for inactive context {}",
                change_set.change_type,
                context_id
            );
            return;
        }

        let ChangeSet {
            change_type,
            selector,
            items,
            should_persist,
            ..
        } = change_set;

        let changes = match change_type {
            ChangeSetType::Full => {
                self.init_data_locked(context, EnvironmentData::from_flags(items), should_persist)
            }
            ChangeSetType::Partial => {
                let mut changes = FlagChanges::default();
                let snapshot = {
                    let mut state = self.state.write();
                    for (_, flag) in items {
                        if flag.supersedes(state.flags.get(&flag.key)) {
                            changes.record(&flag);
                            state.flags.insert(flag);
                        }
                    }
                    (!changes.is_empty() && should_persist).then(|| state.flags.clone())
                };
                if let Some(data) = snapshot {
                    self.environment_store.set_context_data(&context_id, &data);
                }
                changes
            }
            ChangeSetType::None => FlagChanges::default(),
        };

        if !selector.is_empty() {
            self.state.write().selector = selector;
        }
        drop(writer);
        self.notify(changes);
    }

    /// Merge one flag or tombstone under the version rule.
    ///
    /// Returns `false` when the update was dropped, either because the
    /// context is not active or the stored version is not older.
    pub fn upsert(&self, context: &EvaluationContext, flag: Flag) -> bool {
        let writer = self.writer_lock.lock();
        let context_id = Self::hashed_context_id(context);

        let mut changes = FlagChanges::default();
        let data = {
            let mut state = self.state.write();
            if context_id != state.context_id {
                tracing::debug!("Dropping upsert of {} for inactive context", flag.key);
                return false;
            }
            if !flag.supersedes(state.flags.get(&flag.key)) {
                tracing::debug!(
                    "Ignoring {} version {:?}; stored version is not older",
                    flag.key,
                    flag.version
                );
                return false;
            }
            changes.record(&flag);
            state.flags.insert(flag);
            state.flags.clone()
        };

        self.environment_store.set_context_data(&context_id, &data);
        drop(writer);
        self.notify(changes);
        true
    }

    /// The flag for `key`, or `None` if missing or deleted.
    pub fn get_non_deleted_flag(&self, key: &str) -> Option<Flag> {
        self.state
            .read()
            .flags
            .get(key)
            .filter(|flag| !flag.is_deleted())
            .cloned()
    }

    /// Snapshot of every visible flag.
    pub fn get_all_non_deleted(&self) -> EnvironmentData {
        self.state.read().flags.non_deleted()
    }

    /// Latest non-empty selector for the active context.
    pub fn selector(&self) -> Selector {
        self.state.read().selector.clone()
    }

    pub fn register_listener<F>(&self, key: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.flag_listeners.register(key, Arc::new(listener))
    }

    pub fn register_all_flags_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.all_flags_listeners.register(Arc::new(listener))
    }

    /// Number of listeners registered for `key`.
    pub fn listeners_for_key(&self, key: &str) -> usize {
        self.flag_listeners.count(key)
    }

    fn cache_limit(&self) -> i32 {
        if self.max_cached_contexts < 0 {
            -1
        } else {
            self.max_cached_contexts.saturating_add(1)
        }
    }

    /// Caller holds the writer lock and notifies with the returned changes
    /// once it is released.
    fn init_data_locked(
        &self,
        context: &EvaluationContext,
        data: EnvironmentData,
        persist: bool,
    ) -> FlagChanges {
        let context_id = Self::hashed_context_id(context);

        let mut index = self.environment_store.get_index();
        index.update_timestamp(&context_id, chrono::Utc::now().timestamp_millis());
        let removed = index.prune(self.cache_limit());

        let old_flags = {
            let mut state = self.state.write();
            if state.context_id != context_id {
                state.selector = Selector::EMPTY;
            }
            state.current_context = context.clone();
            state.context_id = context_id.clone();
            std::mem::replace(&mut state.flags, data.clone())
        };

        for pruned in &removed {
            self.environment_store.remove_context_data(pruned);
            tracing::debug!("Evicted cached flags for context {}", pruned);
        }
        if persist {
            self.environment_store.set_context_data(&context_id, &data);
        }
        self.environment_store.set_index(&index);
        if let Ok(json) = index.to_json() {
            tracing::debug!("Stored context index is now: {}", json);
        }

        diff(&old_flags, &data)
    }

    fn notify(&self, changes: FlagChanges) {
        if changes.is_empty() {
            return;
        }

        for key in changes.visible {
            let listeners = self.flag_listeners.snapshot(&key);
            if listeners.is_empty() {
                continue;
            }
            self.task_executor.execute_on_main_thread(Box::new(move || {
                for listener in listeners {
                    listener(&key);
                }
            }));
        }

        let listeners = self.all_flags_listeners.snapshot();
        if !listeners.is_empty() {
            let keys: Vec<String> = changes.all.into_iter().collect();
            self.task_executor.execute_on_main_thread(Box::new(move || {
                for listener in listeners {
                    listener(&keys);
                }
            }));
        }
    }
}

/// Keys whose stored flag differs between two full data sets.
fn diff(old: &EnvironmentData, new: &EnvironmentData) -> FlagChanges {
    let mut changes = FlagChanges::default();
    for flag in new.values() {
        if old.get(&flag.key) != Some(flag) {
            changes.record(flag);
        }
    }
    for key in old.keys() {
        if new.get(key).is_none() {
            changes.record_removed(key);
        }
    }
    changes
}
