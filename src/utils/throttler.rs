//! Rate limiting for repeated attempts.
//!
//! The first attempt always runs immediately, as does the first attempt
//! after a quiet period. Attempts made in quick succession are collapsed
//! into a single delayed run whose delay grows exponentially with jitter,
//! up to a ceiling.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Default base retry delay.
pub const DEFAULT_RETRY_TIME: Duration = Duration::from_millis(1_000);

/// Default ceiling for the retry delay.
pub const DEFAULT_MAX_RETRY_TIME: Duration = Duration::from_millis(60_000);

/// Task run by the throttler.
pub type ThrottledTask = Arc<dyn Fn() + Send + Sync>;

pub struct Throttler {
    task: ThrottledTask,
    retry_time: Duration,
    max_retry_time: Duration,
    attempts: Arc<AtomicI32>,
    pending: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl Throttler {
    pub fn new(
        runtime: Handle,
        task: ThrottledTask,
        retry_time: Duration,
        max_retry_time: Duration,
    ) -> Self {
        Self {
            task,
            retry_time,
            max_retry_time,
            attempts: Arc::new(AtomicI32::new(-1)),
            pending: Mutex::new(None),
            runtime,
        }
    }

    pub fn with_defaults(runtime: Handle, task: ThrottledTask) -> Self {
        Self::new(runtime, task, DEFAULT_RETRY_TIME, DEFAULT_MAX_RETRY_TIME)
    }

    /// Run the task now or schedule it, depending on recent activity.
    pub fn attempt_run(&self) {
        let run_now = {
            let mut pending = self.pending.lock();
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

            if attempt < 0 {
                // Initial run is never delayed
                true
            } else if attempt == 0 {
                self.schedule_decrement(self.retry_time);
                true
            } else {
                let jitter_val = self.calculate_jitter_val(attempt as u32);
                self.schedule_decrement(jitter_val);

                let idle = pending.as_ref().map_or(true, |handle| handle.is_finished());
                if idle {
                    let delay = self.backoff_with_jitter(jitter_val);
                    let task = Arc::clone(&self.task);
                    tracing::debug!("Throttling attempt {}, next run in {:?}", attempt, delay);
                    *pending = Some(self.runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        task();
                    }));
                }
                false
            }
        };

        if run_now {
            (self.task)();
        }
    }

    /// Cancel a scheduled run, if any.
    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }

    /// Ceiling-capped exponential delay for the given attempt number.
    pub fn calculate_jitter_val(&self, attempt: u32) -> Duration {
        let factor = if attempt < 31 { 1u64 << attempt } else { i32::MAX as u64 };
        let millis = (self.retry_time.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_retry_time.as_millis() as u64))
    }

    /// Half of `jitter_val` plus a random share of the other half.
    pub fn backoff_with_jitter(&self, jitter_val: Duration) -> Duration {
        let millis = jitter_val.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        let random = rand::thread_rng().gen_range(0..millis);
        Duration::from_millis(millis / 2 + random / 2)
    }

    fn schedule_decrement(&self, after: Duration) {
        let attempts = Arc::clone(&self.attempts);
        self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            attempts.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        self.cancel();
    }
}
