//! Concurrency and hashing helpers shared by the sync core.

pub mod awaitable;
pub mod debounce;
pub mod hash;
pub mod throttler;

pub use awaitable::{AwaitableFuture, ResultCallback};
pub use debounce::{Debounce, DebouncedTask};
pub use hash::url_safe_hash;
pub use throttler::{ThrottledTask, Throttler, DEFAULT_MAX_RETRY_TIME, DEFAULT_RETRY_TIME};
