//! Marshaling of callbacks onto a single designated thread.
//!
//! Flag and status listeners are always invoked on one thread, in the
//! order they were submitted, whatever thread produced the update.

use parking_lot::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Name of the callback thread owned by [`MainThreadExecutor`].
pub const MAIN_THREAD_NAME: &str = "flagkit-main";

pub trait TaskExecutor: Send + Sync {
    /// Run `task` on the designated thread. Runs inline when already there.
    fn execute_on_main_thread(&self, task: Task);

    /// Run `task` on the designated thread after `delay`.
    fn schedule_task(&self, delay: Duration, task: Task);
}

/// Executor backed by a dedicated OS thread.
pub struct MainThreadExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread_id: ThreadId,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    runtime: Option<Handle>,
}

impl MainThreadExecutor {
    /// Start the callback thread. Delayed tasks use a timer thread.
    pub fn new() -> Self {
        Self::start(None)
    }

    /// Start the callback thread, using `runtime` for delayed tasks.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self::start(Some(runtime))
    }

    fn start(runtime: Option<Handle>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let spawned = thread::Builder::new()
            .name(MAIN_THREAD_NAME.to_string())
            .spawn(move || {
                while let Some(task) = rx.blocking_recv() {
                    task();
                }
                tracing::debug!("Callback thread exiting");
            });

        let (thread_id, join_handle) = match spawned {
            Ok(handle) => (handle.thread().id(), Some(handle)),
            Err(e) => {
                // Without a thread the channel has no reader; tasks run on
                // the submitting thread instead.
                tracing::error!("Failed to start callback thread: {}", e);
                (thread::current().id(), None)
            }
        };

        Self {
            sender: Mutex::new(join_handle.as_ref().map(|_| tx)),
            thread_id,
            join_handle: Mutex::new(join_handle),
            runtime,
        }
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop accepting tasks, let queued ones finish, and join the thread.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if self.is_main_thread() {
            return;
        }
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn post(sender: &Mutex<Option<mpsc::UnboundedSender<Task>>>, task: Task) {
        let guard = sender.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    tracing::debug!("Callback thread gone; dropping task");
                }
            }
            None => {
                drop(guard);
                task();
            }
        }
    }
}

impl Default for MainThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor for MainThreadExecutor {
    fn execute_on_main_thread(&self, task: Task) {
        if self.is_main_thread() {
            task();
        } else {
            Self::post(&self.sender, task);
        }
    }

    fn schedule_task(&self, delay: Duration, task: Task) {
        let sender = self.sender.lock().clone();
        let Some(tx) = sender else {
            tracing::debug!("Executor shut down; dropping scheduled task");
            return;
        };
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(task);
                });
            }
            None => {
                let _ = thread::Builder::new()
                    .name("flagkit-timer".to_string())
                    .spawn(move || {
                        thread::sleep(delay);
                        let _ = tx.send(task);
                    });
            }
        }
    }
}

impl Drop for MainThreadExecutor {
    fn drop(&mut self) {
        self.sender.lock().take();
    }
}

/// Runs every task immediately on the calling thread.
///
/// For hosts without a UI thread and for deterministic tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute_on_main_thread(&self, task: Task) {
        task();
    }

    fn schedule_task(&self, delay: Duration, task: Task) {
        let _ = thread::Builder::new()
            .name("flagkit-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                task();
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_runs_on_named_thread() {
        let executor = MainThreadExecutor::new();
        let (tx, rx) = std_mpsc::channel();
        executor.execute_on_main_thread(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        }));
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some(MAIN_THREAD_NAME));
        executor.shutdown();
    }

    #[test]
    fn test_preserves_submission_order() {
        let executor = MainThreadExecutor::new();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            executor.execute_on_main_thread(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        let received: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, (0..20).collect::<Vec<_>>());
        executor.shutdown();
    }

    #[test]
    fn test_schedule_task_runs_after_delay() {
        let executor = MainThreadExecutor::new();
        let (tx, rx) = std_mpsc::channel();
        let started = std::time::Instant::now();
        executor.schedule_task(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        executor.shutdown();
    }

    #[tokio::test]
    async fn test_schedule_task_on_runtime() {
        let executor = MainThreadExecutor::with_runtime(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.schedule_task(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send(thread::current().name().map(str::to_string));
            }),
        );
        let name = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name.as_deref(), Some(MAIN_THREAD_NAME));
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let executor = MainThreadExecutor::new();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            executor.execute_on_main_thread(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                let _ = tx.send(i);
            }));
        }
        executor.shutdown();
        assert_eq!(rx.try_iter().count(), 5);
    }

    #[test]
    fn test_inline_executor() {
        let (tx, rx) = std_mpsc::channel();
        InlineExecutor.execute_on_main_thread(Box::new(move || {
            let _ = tx.send(thread::current().id());
        }));
        assert_eq!(rx.try_recv().unwrap(), thread::current().id());
    }
}
