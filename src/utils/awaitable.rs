//! Single-assignment future with blocking and async waits.
//!
//! Bridges the callback-style API onto synchronous waits in tests and host
//! glue code. The first completion wins; later ones are logged and ignored.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{ErrorCode, Result, SyncError};

/// Completion callback used throughout the callback-style API.
pub type ResultCallback<T> = Box<dyn FnOnce(Result<T>) + Send>;

struct Shared<T> {
    outcome: Mutex<Option<Result<T>>>,
    condvar: Condvar,
    notify: Notify,
}

/// A value or error that is set exactly once.
pub struct AwaitableFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AwaitableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AwaitableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> AwaitableFuture<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: Mutex::new(None),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Complete with a value. Returns false if already completed.
    pub fn set(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete with an error. Returns false if already completed.
    pub fn set_error(&self, error: SyncError) -> bool {
        self.complete(Err(error))
    }

    pub fn complete(&self, outcome: Result<T>) -> bool {
        {
            let mut guard = self.shared.outcome.lock();
            if guard.is_some() {
                tracing::warn!("Awaitable future completed more than once; ignoring");
                return false;
            }
            *guard = Some(outcome);
        }
        self.shared.condvar.notify_all();
        self.shared.notify.notify_waiters();
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// The outcome if already completed, without waiting.
    pub fn peek(&self) -> Option<Result<T>> {
        self.shared.outcome.lock().clone()
    }

    /// Block the current thread until completed.
    pub fn get(&self) -> Result<T> {
        let mut guard = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            self.shared.condvar.wait(&mut guard);
        }
    }

    /// Block the current thread until completed or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            if self
                .shared
                .condvar
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return match guard.as_ref() {
                    Some(outcome) => outcome.clone(),
                    None => Err(timeout_error(timeout)),
                };
            }
        }
    }

    /// Wait asynchronously until completed.
    pub async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait asynchronously until completed or `timeout` elapses.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(timeout_error(timeout)),
        }
    }

    /// A callback that completes this future.
    pub fn callback(&self) -> ResultCallback<T> {
        let future = self.clone();
        Box::new(move |outcome| {
            future.complete(outcome);
        })
    }
}

fn timeout_error(timeout: Duration) -> SyncError {
    SyncError::new(
        ErrorCode::AwaitTimeout,
        format!("Timed out after {:?} waiting for result", timeout),
    )
}
