//! Fallback and recovery timing for the synchronizer loop.
//!
//! A fresh [`Conditions`] is built each time a synchronizer becomes active.
//! Nothing is spawned: each condition is a deadline, and [`Conditions::fired`]
//! sleeps until the earliest one. Dropping the value cancels both timers.

use std::time::Duration;
use tokio::time::Instant;

use super::source::{SourceResult, SourceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// The current synchronizer stayed interrupted too long.
    Fallback,
    /// Time to retry the preferred synchronizer.
    Recovery,
}

#[derive(Debug)]
pub struct Conditions {
    fallback_timeout: Option<Duration>,
    fallback_deadline: Option<Instant>,
    recovery_deadline: Option<Instant>,
}

impl Conditions {
    /// Conditions for a synchronizer.
    ///
    /// With a single available synchronizer there is nowhere to go, so
    /// neither condition applies. Fallback applies otherwise; recovery
    /// only applies away from the prime synchronizer.
    pub fn new(
        fallback_timeout: Duration,
        recovery_timeout: Duration,
        available_synchronizers: usize,
        is_prime: bool,
    ) -> Self {
        if available_synchronizers <= 1 {
            return Self::none();
        }
        Self {
            fallback_timeout: Some(fallback_timeout),
            fallback_deadline: None,
            recovery_deadline: (!is_prime).then(|| Instant::now() + recovery_timeout),
        }
    }

    /// Conditions that never fire.
    pub fn none() -> Self {
        Self {
            fallback_timeout: None,
            fallback_deadline: None,
            recovery_deadline: None,
        }
    }

    /// Observe a result from the synchronizer.
    ///
    /// Data cancels a pending fallback. An interruption arms one unless it
    /// is already running.
    pub fn inform(&mut self, result: &SourceResult) {
        let Some(timeout) = self.fallback_timeout else {
            return;
        };
        match result {
            SourceResult::ChangeSet(_) => {
                self.fallback_deadline = None;
            }
            SourceResult::Status(SourceStatus::Interrupted(_)) => {
                if self.fallback_deadline.is_none() {
                    tracing::debug!("Synchronizer interrupted; fallback in {:?}", timeout);
                    self.fallback_deadline = Some(Instant::now() + timeout);
                }
            }
            SourceResult::Status(_) => {}
        }
    }

    pub fn is_fallback_armed(&self) -> bool {
        self.fallback_deadline.is_some()
    }

    pub fn is_recovery_armed(&self) -> bool {
        self.recovery_deadline.is_some()
    }

    /// Resolves when the earliest armed condition expires; pending forever
    /// when none is armed.
    pub async fn fired(&self) -> ConditionKind {
        let next = match (self.fallback_deadline, self.recovery_deadline) {
            (Some(fallback), Some(recovery)) if recovery < fallback => {
                Some((recovery, ConditionKind::Recovery))
            }
            (Some(fallback), _) => Some((fallback, ConditionKind::Fallback)),
            (None, Some(recovery)) => Some((recovery, ConditionKind::Recovery)),
            (None, None) => None,
        };
        match next {
            Some((deadline, kind)) => {
                tokio::time::sleep_until(deadline).await;
                kind
            }
            None => std::future::pending().await,
        }
    }
}
