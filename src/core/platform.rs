//! Host platform collaborators.
//!
//! The host reports network reachability and foreground state, and owns
//! the analytics pipeline that must follow the connection mode.

use std::sync::Arc;

/// Called with the new value of a platform signal.
pub type PlatformListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Identifies a registered platform listener for removal.
pub type ListenerId = u64;

pub trait PlatformState: Send + Sync {
    fn is_network_available(&self) -> bool;

    fn is_foreground(&self) -> bool;

    fn add_connectivity_listener(&self, listener: PlatformListener) -> ListenerId;

    fn remove_connectivity_listener(&self, id: ListenerId);

    fn add_foreground_listener(&self, listener: PlatformListener) -> ListenerId;

    fn remove_foreground_listener(&self, id: ListenerId);
}

/// Receives mode changes that affect analytics delivery.
pub trait EventProcessor: Send + Sync {
    fn set_offline(&self, offline: bool);

    fn set_in_background(&self, in_background: bool);
}

/// Event processor for hosts without analytics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventProcessor;

impl EventProcessor for NoOpEventProcessor {
    fn set_offline(&self, _offline: bool) {}

    fn set_in_background(&self, _in_background: bool) {}
}
