//! Local pause/resume gate.
//!
//! A dispatcher loop that's blocked on `BRPOPLPUSH wait` has no way to
//! notice a pause until that call returns, so the gate here is what it
//! checks *before* issuing the next blocking pop — not a substitute for
//! the store-side `meta-paused` routing, which is what actually stops new
//! jobs from landing in `wait` in the first place. [`crate::queue::Queue`]
//! keeps this gate in sync with pauses issued by other processes by
//! watching [`crate::job::JobStore::pause_notify`] in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cheaply cloned; every clone observes the same underlying flag.
#[derive(Clone)]
pub struct PauseGate {
    paused: Arc<AtomicBool>,
    resumed: Arc<Notify>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PauseGate {
    pub fn new(initially_paused: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(initially_paused)),
            resumed: Arc::new(Notify::new()),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumed.notify_waiters();
    }

    /// Blocks the caller until the gate is resumed. Registers the
    /// notification before re-checking the flag so a `resume()` that
    /// races this call is never missed.
    pub async fn wait_until_resumed(&self) {
        loop {
            if !self.is_paused() {
                return;
            }
            let notified = self.resumed.notified();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_not_paused() {
        let gate = PauseGate::new(false);
        tokio::time::timeout(Duration::from_millis(50), gate.wait_until_resumed())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn wait_unblocks_on_resume() {
        let gate = PauseGate::new(true);
        let waiter = gate.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_until_resumed().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should finish after resume")
            .unwrap();
    }

    #[test]
    fn pause_then_resume_round_trips_the_flag() {
        let gate = PauseGate::new(false);
        gate.pause();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }
}
