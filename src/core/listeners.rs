//! Listener registries with drop-guard unregistration.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Called with the key of a flag whose visible value changed.
pub type FlagChangeListener = dyn Fn(&str) + Send + Sync;

/// Called with every key affected by one update, deletions included.
pub type AllFlagsListener = dyn Fn(&[String]) + Send + Sync;

/// Registration guard. Dropping it unregisters the listener.
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    unregister: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    fn new(unregister: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }

    /// Keep the listener registered for the lifetime of its registry.
    pub fn detach(mut self) {
        self.unregister.take();
    }

    pub fn unregister(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("attached", &self.unregister.is_some())
            .finish()
    }
}

struct Entries<L: ?Sized> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Arc<L>)>>,
}

/// Unkeyed listener set.
pub struct ListenerRegistry<L: ?Sized> {
    entries: Arc<Entries<L>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Entries {
                next_id: AtomicU64::new(0),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn register(&self, listener: Arc<L>) -> ListenerHandle {
        let id = self.entries.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.listeners.write().push((id, listener));

        let weak: Weak<Entries<L>> = Arc::downgrade(&self.entries);
        ListenerHandle::new(move || {
            if let Some(entries) = weak.upgrade() {
                entries.listeners.write().retain(|(i, _)| *i != id);
            }
        })
    }

    /// Listeners registered right now, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

struct KeyedEntries<L: ?Sized> {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<(u64, Arc<L>)>>>,
}

/// Listener sets keyed by flag key.
pub struct KeyedListenerRegistry<L: ?Sized> {
    entries: Arc<KeyedEntries<L>>,
}

impl<L: ?Sized + Send + Sync + 'static> KeyedListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(KeyedEntries {
                next_id: AtomicU64::new(0),
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn register(&self, key: &str, listener: Arc<L>) -> ListenerHandle {
        let id = self.entries.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .listeners
            .write()
            .entry(key.to_string())
            .or_default()
            .push((id, listener));

        let weak: Weak<KeyedEntries<L>> = Arc::downgrade(&self.entries);
        let key = key.to_string();
        ListenerHandle::new(move || {
            let Some(entries) = weak.upgrade() else {
                return;
            };
            let mut listeners = entries.listeners.write();
            if let Some(for_key) = listeners.get_mut(&key) {
                for_key.retain(|(i, _)| *i != id);
                if for_key.is_empty() {
                    listeners.remove(&key);
                }
            }
        })
    }

    pub fn snapshot(&self, key: &str) -> Vec<Arc<L>> {
        self.entries
            .listeners
            .read()
            .get(key)
            .map(|for_key| for_key.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, key: &str) -> usize {
        self.entries
            .listeners
            .read()
            .get(key)
            .map_or(0, Vec::len)
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for KeyedListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}
