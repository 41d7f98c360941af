//! A self-rescheduling one-shot timer, cancelled by generation rather than
//! by aborting its [`tokio::task::JoinHandle`].
//!
//! Distributed-job timers (the delay controller's wakeup, lock renewal)
//! are naturally one-shot: each firing decides whether to schedule the
//! next one. A superseded timer should simply do nothing when it fires,
//! not be torn down mid-flight, so cancellation here is "bump a counter
//! and let the stale firing notice" rather than `JoinHandle::abort`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared generation counter. Clone freely; every clone observes the same
/// counter.
#[derive(Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    /// Invalidates every ticket issued before this call.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// A ticket that can later be checked for staleness with
    /// [`Generation::is_current`].
    pub fn ticket(&self) -> u64 {
        self.current()
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        self.current() == ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumping_invalidates_earlier_tickets() {
        let gen = Generation::new();
        let ticket = gen.ticket();
        assert!(gen.is_current(ticket));
        gen.bump();
        assert!(!gen.is_current(ticket));
    }

    #[test]
    fn fresh_ticket_after_bump_is_current() {
        let gen = Generation::new();
        gen.bump();
        let ticket = gen.ticket();
        assert!(gen.is_current(ticket));
    }
}
