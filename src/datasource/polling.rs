//! Polling initializer and synchronizer.
//!
//! Both delegate the actual request to a user-supplied fetch function, so
//! no HTTP client lives here. The synchronizer spaces polls by the
//! configured interval plus jitter and backs off exponentially while
//! requests fail.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::source::{
    CloseSignal, Initializer, InitializerFactory, SourceFuture, SourceResult, Synchronizer,
    SynchronizerFactory,
};
use super::{ClientContext, DataSourceUpdateSink};
use crate::error::{Result, SyncError};
use crate::types::{ChangeSet, EvaluationContext, Selector};

/// Default jitter in milliseconds.
pub const DEFAULT_JITTER_MS: u64 = 1000;

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default maximum interval in seconds.
pub const DEFAULT_MAX_INTERVAL_SECS: u64 = 3600;

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<ChangeSet>> + Send>>;

/// Fetches the flag payload for a context, resuming from a selector.
pub type FetchFn = Arc<dyn Fn(EvaluationContext, Selector) -> FetchFuture + Send + Sync>;

/// Wrap an async function as a [`FetchFn`].
pub fn fetch_fn<F, Fut>(fetch: F) -> FetchFn
where
    F: Fn(EvaluationContext, Selector) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ChangeSet>> + Send + 'static,
{
    Arc::new(
        move |context: EvaluationContext, selector: Selector| -> FetchFuture {
            Box::pin(fetch(context, selector))
        },
    )
}

/// Configuration for polling synchronizers.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Time between successful polls.
    pub interval: Duration,

    /// Maximum jitter added to interval. Default: 1000ms
    pub jitter_ms: u64,

    /// Backoff multiplier on errors. Default: 2.0
    pub backoff_multiplier: f64,

    /// Maximum interval after backoff. Default: 1 hour
    pub max_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: crate::core::DEFAULT_POLLING_INTERVAL,
            jitter_ms: DEFAULT_JITTER_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_interval: Duration::from_secs(DEFAULT_MAX_INTERVAL_SECS),
        }
    }
}

impl PollingConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn builder() -> PollingConfigBuilder {
        PollingConfigBuilder::default()
    }

    /// Poll spacing for a client context: the background interval while
    /// backgrounded, the foreground one otherwise.
    pub fn for_context(client_context: &ClientContext) -> Self {
        let interval = if client_context.in_background {
            client_context.options.background_polling_interval
        } else {
            client_context.options.polling_interval
        };
        Self::new(interval)
    }

    /// Delay after `consecutive_errors` failures in a row.
    pub fn calculate_backoff(&self, consecutive_errors: u32) -> Duration {
        let base_ms = self.interval.as_millis() as f64;
        let backoff_ms = base_ms * self.backoff_multiplier.powi(consecutive_errors as i32);
        let capped_ms = backoff_ms.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// `interval` plus up to `jitter_ms` of random delay.
    pub fn calculate_next_delay(&self, interval: Duration) -> Duration {
        let jitter = (rand::random::<f64>() * self.jitter_ms as f64) as u64;
        interval + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Default)]
pub struct PollingConfigBuilder {
    interval: Option<Duration>,
    jitter_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    max_interval: Option<Duration>,
}

impl PollingConfigBuilder {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn jitter_ms(mut self, jitter: u64) -> Self {
        self.jitter_ms = Some(jitter);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max_interval = Some(max);
        self
    }

    pub fn build(self) -> PollingConfig {
        let defaults = PollingConfig::default();
        PollingConfig {
            interval: self.interval.unwrap_or(defaults.interval),
            jitter_ms: self.jitter_ms.unwrap_or(defaults.jitter_ms),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            max_interval: self.max_interval.unwrap_or(defaults.max_interval),
        }
    }
}

/// Map a fetch error onto a source status.
fn status_for_error(error: SyncError) -> SourceResult {
    if error.is_recoverable() {
        SourceResult::interrupted(Some(error))
    } else {
        SourceResult::terminal_error(error)
    }
}

/// Single fetch used to seed the cache.
pub struct PollingInitializer {
    fetch: FetchFn,
    context: EvaluationContext,
    selector: Selector,
    close_signal: CloseSignal,
}

impl PollingInitializer {
    pub fn new(fetch: FetchFn, context: EvaluationContext, selector: Selector) -> Self {
        Self {
            fetch,
            context,
            selector,
            close_signal: CloseSignal::new(),
        }
    }

    pub fn factory(fetch: FetchFn) -> impl InitializerFactory {
        move |client_context: &ClientContext| -> Option<Arc<dyn Initializer>> {
            Some(Arc::new(PollingInitializer::new(
                Arc::clone(&fetch),
                client_context.evaluation_context.clone(),
                client_context.sink.selector(),
            )))
        }
    }
}

impl Initializer for PollingInitializer {
    fn run(&self) -> SourceFuture {
        let request = (self.fetch)(self.context.clone(), self.selector.clone());
        let close_signal = self.close_signal.clone();
        Box::pin(async move {
            close_signal
                .guard(async move {
                    match request.await {
                        Ok(change_set) => Ok(SourceResult::ChangeSet(change_set)),
                        Err(e) => Ok(status_for_error(e)),
                    }
                })
                .await
        })
    }

    fn close(&self) {
        self.close_signal.close();
    }
}

#[derive(Debug)]
struct PollState {
    next_poll_at: Option<Instant>,
    consecutive_errors: u32,
}

struct PollingInner {
    config: PollingConfig,
    fetch: FetchFn,
    context: EvaluationContext,
    sink: Arc<dyn DataSourceUpdateSink>,
    state: Mutex<PollState>,
}

impl PollingInner {
    async fn poll_once(&self) -> Result<SourceResult> {
        let wait_until = self.state.lock().next_poll_at;
        if let Some(deadline) = wait_until {
            tokio::time::sleep_until(deadline).await;
        }

        let result = (self.fetch)(self.context.clone(), self.sink.selector()).await;

        let mut state = self.state.lock();
        match result {
            Ok(change_set) => {
                state.consecutive_errors = 0;
                let delay = self.config.calculate_next_delay(self.config.interval);
                state.next_poll_at = Some(Instant::now() + delay);
                tracing::debug!("Poll succeeded, next poll in {:?}", delay);
                Ok(SourceResult::ChangeSet(change_set))
            }
            Err(e) => {
                state.consecutive_errors += 1;
                let delay = self.config.calculate_backoff(state.consecutive_errors);
                state.next_poll_at = Some(Instant::now() + delay);
                tracing::debug!(
                    "Poll failed (consecutive errors: {}), backing off to {:?}",
                    state.consecutive_errors,
                    delay
                );
                Ok(status_for_error(e))
            }
        }
    }
}

/// Periodic fetch as a synchronizer. The first `next()` polls immediately.
pub struct PollingSynchronizer {
    inner: Arc<PollingInner>,
    close_signal: CloseSignal,
}

impl PollingSynchronizer {
    pub fn new(
        config: PollingConfig,
        fetch: FetchFn,
        context: EvaluationContext,
        sink: Arc<dyn DataSourceUpdateSink>,
    ) -> Self {
        Self {
            inner: Arc::new(PollingInner {
                config,
                fetch,
                context,
                sink,
                state: Mutex::new(PollState {
                    next_poll_at: None,
                    consecutive_errors: 0,
                }),
            }),
            close_signal: CloseSignal::new(),
        }
    }

    /// Factory polling at the interval configured for the client context.
    pub fn factory(fetch: FetchFn) -> impl SynchronizerFactory {
        move |client_context: &ClientContext| -> Option<Arc<dyn Synchronizer>> {
            Some(Arc::new(PollingSynchronizer::new(
                PollingConfig::for_context(client_context),
                Arc::clone(&fetch),
                client_context.evaluation_context.clone(),
                Arc::clone(&client_context.sink),
            )))
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.state.lock().consecutive_errors
    }
}

impl Synchronizer for PollingSynchronizer {
    fn next(&self) -> SourceFuture {
        let inner = Arc::clone(&self.inner);
        let close_signal = self.close_signal.clone();
        Box::pin(async move { close_signal.guard(inner.poll_once()).await })
    }

    fn close(&self) {
        self.close_signal.close();
    }
}
