//! Promotes delayed jobs into `wait`/`priority` once their delay elapses.
//!
//! Two paths keep the armed wakeup honest:
//!
//! - a fast path: [`crate::job::JobStore::delay_notify`] fires the moment
//!   any process adds a new delayed job, so the controller can re-check
//!   immediately instead of sleeping past a job that just became the new
//!   soonest-to-fire entry;
//! - a guardian: an unconditional poll every `polling_interval_ms`, so a
//!   missed or coalesced notification (pub/sub delivers at-most-once) can
//!   never stall promotion for longer than one guardian tick.
//!
//! Overlapping wakeups are superseded by generation rather than by
//! cancelling a sleep in flight: each loop iteration checks its ticket is
//! still current before acting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error};

use crate::job::JobStore;
use crate::timer::Generation;

pub struct DelayControllerHandle {
    generation: Generation,
    task: tokio::task::JoinHandle<()>,
}

impl DelayControllerHandle {
    pub fn stop(self) {
        self.generation.bump();
        self.task.abort();
    }
}

pub fn spawn(store: Arc<dyn JobStore>, guardian_interval_ms: u64) -> DelayControllerHandle {
    let generation = Generation::new();
    let gen_for_task = generation.clone();
    let wake: Arc<Notify> = store.delay_notify();

    let task = tokio::spawn(async move {
        let ticket = gen_for_task.ticket();
        loop {
            if !gen_for_task.is_current(ticket) {
                return;
            }

            let next_due = match store.promote_delayed().await {
                Ok(next_due) => next_due,
                Err(err) => {
                    error!(error = %err, "failed to promote delayed jobs");
                    None
                }
            };

            let sleep_ms = next_due
                .map(|due_ms| {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    (due_ms - now_ms).max(0) as u64
                })
                .unwrap_or(guardian_interval_ms)
                .min(guardian_interval_ms);

            debug!(sleep_ms, "delay controller sleeping");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                _ = wake.notified() => {}
            }
        }
    });

    DelayControllerHandle { generation, task }
}
