//! Keeps a claimed job's lock alive for as long as its handler runs.
//!
//! Renewal is a self-rescheduling one-shot timer, not a periodic
//! `tokio::time::interval`: each tick asks the store to extend the TTL and,
//! only on success, schedules the next tick. A failure (lock already lost
//! to a reaper reclaim) simply stops rescheduling rather than needing an
//! explicit cancel — the handler's own failure path discovers the lost
//! lock when it tries to report its result.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::job::JobStore;
use crate::timer::Generation;

/// Handle returned by [`spawn`]. Dropping it does not stop renewal on its
/// own — call [`LockRenewerHandle::stop`] once the handler finishes so the
/// background task exits promptly instead of renewing a lock nobody needs.
pub struct LockRenewerHandle {
    generation: Generation,
    task: tokio::task::JoinHandle<()>,
}

impl LockRenewerHandle {
    pub fn stop(self) {
        self.generation.bump();
        self.task.abort();
    }
}

/// Spawns the renewal loop for one claimed job.
///
/// `renew_time_ms` is how often to renew (typically half of
/// `lock_duration_ms`, per [`crate::QueueConfig::lock_renew_time_ms`]);
/// `lock_duration_ms` is the TTL each renewal extends the lock by.
pub fn spawn(
    store: Arc<dyn JobStore>,
    job_id: String,
    lock_token: String,
    renew_time_ms: u64,
    lock_duration_ms: u64,
) -> LockRenewerHandle {
    let generation = Generation::new();
    let gen_for_task = generation.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(renew_time_ms)).await;

            let ticket = gen_for_task.ticket();
            if !gen_for_task.is_current(ticket) {
                return;
            }

            match store.renew_lock(&job_id, &lock_token, lock_duration_ms).await {
                Ok(()) => {
                    debug!(job_id = %job_id, "renewed job lock");
                }
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "lock renewal failed, giving up");
                    return;
                }
            }
        }
    });

    LockRenewerHandle { generation, task }
}
