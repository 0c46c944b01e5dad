use std::time::Duration;

use crate::error::{Result, SyncError};

pub const DEFAULT_MAX_CACHED_CONTEXTS: i32 = 5;
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BACKGROUND_POLLING_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const MIN_BACKGROUND_POLLING_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mobile_key: String,
    /// Foreground mode is streaming when true, polling otherwise.
    pub stream: bool,
    pub disable_background_updating: bool,
    /// Start in the forced-offline state.
    pub offline: bool,
    /// Contexts cached besides the active one. Negative means unbounded.
    pub max_cached_contexts: i32,
    pub polling_interval: Duration,
    pub background_polling_interval: Duration,
    pub fallback_timeout: Duration,
    pub recovery_timeout: Duration,
    pub generate_anonymous_keys: bool,
}

impl SyncOptions {
    pub fn new(mobile_key: impl Into<String>) -> Self {
        Self {
            mobile_key: mobile_key.into(),
            stream: true,
            disable_background_updating: false,
            offline: false,
            max_cached_contexts: DEFAULT_MAX_CACHED_CONTEXTS,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            background_polling_interval: DEFAULT_BACKGROUND_POLLING_INTERVAL,
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            generate_anonymous_keys: false,
        }
    }

    pub fn builder(mobile_key: impl Into<String>) -> SyncOptionsBuilder {
        SyncOptionsBuilder::new(mobile_key)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mobile_key.is_empty() {
            return Err(SyncError::config_error("Mobile key is required"));
        }

        if self.polling_interval.is_zero() {
            return Err(SyncError::config_error("Polling interval must be positive"));
        }

        if self.fallback_timeout.is_zero() {
            return Err(SyncError::config_error("Fallback timeout must be positive"));
        }

        if self.recovery_timeout.is_zero() {
            return Err(SyncError::config_error("Recovery timeout must be positive"));
        }

        Ok(())
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new("")
    }
}

pub struct SyncOptionsBuilder {
    mobile_key: String,
    stream: Option<bool>,
    disable_background_updating: Option<bool>,
    offline: Option<bool>,
    max_cached_contexts: Option<i32>,
    polling_interval: Option<Duration>,
    background_polling_interval: Option<Duration>,
    fallback_timeout: Option<Duration>,
    recovery_timeout: Option<Duration>,
    generate_anonymous_keys: Option<bool>,
}

impl SyncOptionsBuilder {
    pub fn new(mobile_key: impl Into<String>) -> Self {
        Self {
            mobile_key: mobile_key.into(),
            stream: None,
            disable_background_updating: None,
            offline: None,
            max_cached_contexts: None,
            polling_interval: None,
            background_polling_interval: None,
            fallback_timeout: None,
            recovery_timeout: None,
            generate_anonymous_keys: None,
        }
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn disable_background_updating(mut self, disable: bool) -> Self {
        self.disable_background_updating = Some(disable);
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = Some(offline);
        self
    }

    pub fn max_cached_contexts(mut self, max: i32) -> Self {
        self.max_cached_contexts = Some(max);
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    /// Clamped to at least fifteen minutes.
    pub fn background_polling_interval(mut self, interval: Duration) -> Self {
        self.background_polling_interval = Some(interval.max(MIN_BACKGROUND_POLLING_INTERVAL));
        self
    }

    pub fn fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = Some(timeout);
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = Some(timeout);
        self
    }

    pub fn generate_anonymous_keys(mut self, generate: bool) -> Self {
        self.generate_anonymous_keys = Some(generate);
        self
    }

    pub fn build(self) -> SyncOptions {
        SyncOptions {
            mobile_key: self.mobile_key,
            stream: self.stream.unwrap_or(true),
            disable_background_updating: self.disable_background_updating.unwrap_or(false),
            offline: self.offline.unwrap_or(false),
            max_cached_contexts: self
                .max_cached_contexts
                .unwrap_or(DEFAULT_MAX_CACHED_CONTEXTS),
            polling_interval: self.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL),
            background_polling_interval: self
                .background_polling_interval
                .unwrap_or(DEFAULT_BACKGROUND_POLLING_INTERVAL),
            fallback_timeout: self.fallback_timeout.unwrap_or(DEFAULT_FALLBACK_TIMEOUT),
            recovery_timeout: self.recovery_timeout.unwrap_or(DEFAULT_RECOVERY_TIMEOUT),
            generate_anonymous_keys: self.generate_anonymous_keys.unwrap_or(false),
        }
    }
}
