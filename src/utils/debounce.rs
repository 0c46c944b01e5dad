//! Coalescing of rapid repeated actions.
//!
//! At most one task runs at a time and at most one waits behind it. A newer
//! call replaces the waiting task, so a burst of calls results in the
//! in-flight run plus one run of the latest task.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Task accepted by [`Debounce::call`].
pub type DebouncedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct DebounceState {
    pending: Option<DebouncedTask>,
    in_flight: bool,
}

pub struct Debounce {
    state: Arc<Mutex<DebounceState>>,
    runtime: Handle,
}

impl Debounce {
    pub fn new(runtime: Handle) -> Self {
        Self {
            state: Arc::new(Mutex::new(DebounceState::default())),
            runtime,
        }
    }

    /// Queue `task`, replacing any task that has not started yet.
    pub fn call<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.state.lock().pending = Some(Box::pin(task));
        Self::schedule_pending(Arc::clone(&self.state), self.runtime.clone());
    }

    fn schedule_pending(state: Arc<Mutex<DebounceState>>, runtime: Handle) {
        let task = {
            let mut guard = state.lock();
            if guard.in_flight {
                return;
            }
            match guard.pending.take() {
                Some(task) => {
                    guard.in_flight = true;
                    task
                }
                None => return,
            }
        };

        let next_runtime = runtime.clone();
        runtime.spawn(async move {
            task.await;
            state.lock().in_flight = false;
            Self::schedule_pending(state, next_runtime);
        });
    }
}
