//! Bookkeeping for which source is active.
//!
//! Walks the initializer list once and the synchronizer list in a ring,
//! skipping blocked synchronizers. Activating a source closes the previous
//! one, and closing the manager closes whatever is active and refuses to
//! hand out anything further.

use parking_lot::Mutex;
use std::sync::Arc;

use super::source::{Initializer, InitializerFactory, Synchronizer, SynchronizerFactory};
use super::ClientContext;

enum ActiveSource {
    Initializer(Arc<dyn Initializer>),
    Synchronizer(Arc<dyn Synchronizer>),
}

impl ActiveSource {
    fn close(&self) {
        match self {
            ActiveSource::Initializer(source) => source.close(),
            ActiveSource::Synchronizer(source) => source.close(),
        }
    }
}

struct SynchronizerSlot {
    factory: Arc<dyn SynchronizerFactory>,
    blocked: bool,
}

struct ManagerState {
    synchronizers: Vec<SynchronizerSlot>,
    /// -1 before the first call to `next_synchronizer`.
    synchronizer_index: isize,
    initializer_index: isize,
    current_synchronizer: Option<usize>,
    active: Option<ActiveSource>,
    shutdown: bool,
}

impl ManagerState {
    fn first_available(&self) -> Option<usize> {
        self.synchronizers.iter().position(|s| !s.blocked)
    }

    fn available_count(&self) -> usize {
        self.synchronizers.iter().filter(|s| !s.blocked).count()
    }

    fn advance_to_available(&mut self) -> Option<usize> {
        let len = self.synchronizers.len();
        for _ in 0..len {
            self.synchronizer_index += 1;
            if self.synchronizer_index >= len as isize {
                self.synchronizer_index = 0;
            }
            let index = self.synchronizer_index as usize;
            if !self.synchronizers[index].blocked {
                return Some(index);
            }
        }
        None
    }

    fn replace_active(&mut self, source: ActiveSource) -> Option<ActiveSource> {
        self.active.replace(source)
    }
}

pub struct SourceManager {
    client_context: ClientContext,
    initializers: Vec<Arc<dyn InitializerFactory>>,
    state: Mutex<ManagerState>,
}

impl SourceManager {
    pub fn new(
        client_context: ClientContext,
        initializers: Vec<Arc<dyn InitializerFactory>>,
        synchronizers: Vec<Arc<dyn SynchronizerFactory>>,
    ) -> Self {
        Self {
            client_context,
            initializers,
            state: Mutex::new(ManagerState {
                synchronizers: synchronizers
                    .into_iter()
                    .map(|factory| SynchronizerSlot {
                        factory,
                        blocked: false,
                    })
                    .collect(),
                synchronizer_index: -1,
                initializer_index: -1,
                current_synchronizer: None,
                active: None,
                shutdown: false,
            }),
        }
    }

    pub fn has_initializers(&self) -> bool {
        !self.initializers.is_empty()
    }

    pub fn has_available_sources(&self) -> bool {
        self.has_initializers() || self.available_synchronizer_count() > 0
    }

    /// Build the next initializer and make it active.
    ///
    /// Factories returning `None` are skipped. Returns `None` once the list
    /// is exhausted or the manager is closed.
    pub fn next_initializer(&self) -> Option<Arc<dyn Initializer>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            state.initializer_index += 1;
            let factory = self.initializers.get(state.initializer_index as usize)?;
            if let Some(initializer) = factory.build(&self.client_context) {
                let previous =
                    state.replace_active(ActiveSource::Initializer(Arc::clone(&initializer)));
                drop(state);
                if let Some(previous) = previous {
                    previous.close();
                }
                return Some(initializer);
            }
        }
    }

    /// Build the next unblocked synchronizer, wrapping around the list, and
    /// make it active.
    pub fn next_synchronizer(&self) -> Option<Arc<dyn Synchronizer>> {
        let mut state = self.state.lock();
        if state.shutdown {
            state.current_synchronizer = None;
            return None;
        }

        let limit = state.synchronizers.len();
        for _ in 0..limit {
            let Some(index) = state.advance_to_available() else {
                break;
            };
            let factory = Arc::clone(&state.synchronizers[index].factory);
            let Some(synchronizer) = factory.build(&self.client_context) else {
                tracing::debug!("Synchronizer factory {} produced nothing; skipping", index);
                continue;
            };
            state.current_synchronizer = Some(index);
            let previous =
                state.replace_active(ActiveSource::Synchronizer(Arc::clone(&synchronizer)));
            drop(state);
            if let Some(previous) = previous {
                previous.close();
            }
            return Some(synchronizer);
        }

        state.current_synchronizer = None;
        None
    }

    /// Never hand out the current synchronizer again.
    pub fn block_current_synchronizer(&self) {
        let mut state = self.state.lock();
        if let Some(index) = state.current_synchronizer {
            state.synchronizers[index].blocked = true;
        }
    }

    /// Restart the synchronizer ring from the first available entry.
    pub fn reset_source_index(&self) {
        self.state.lock().synchronizer_index = -1;
    }

    /// Whether the current synchronizer is the first unblocked one.
    pub fn is_prime_synchronizer(&self) -> bool {
        let state = self.state.lock();
        match state.first_available() {
            Some(first) => state.synchronizer_index == first as isize,
            None => false,
        }
    }

    pub fn available_synchronizer_count(&self) -> usize {
        self.state.lock().available_count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Close the active source and stop handing out new ones.
    pub fn close(&self) {
        let active = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.active.take()
        };
        if let Some(active) = active {
            active.close();
        }
    }
}
