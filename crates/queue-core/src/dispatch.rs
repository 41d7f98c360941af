//! Drives the claim → handle → report loop for one worker concurrency
//! slot, and the bounded pool of slots a [`crate::Queue::process`] call
//! spins up.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::events::{Event, EventBus, EventKind, Origin};
use crate::job::{ClaimedJob, FailureKind, Job, JobStore};
use crate::lock;
use crate::pause::PauseGate;

/// A handler's own error type, opaque to the dispatcher. Any `Error` can
/// be converted via `?` the way `anyhow::Error` callers expect.
pub type HandlerError = anyhow::Error;

/// Processes one job and returns its result payload.
///
/// Implemented automatically for any `Fn(Job) -> Future<Output =
/// Result<Value, HandlerError>>` closure, mirroring how most queue
/// consumers only ever supply a closure and never implement the trait by
/// hand.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, job: Job) -> Result<Value, HandlerError> {
        self(job).await
    }
}

/// Bounded pool of concurrency slots pulling jobs from one [`JobStore`].
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    events: EventBus,
    pause_gate: PauseGate,
    handler: Arc<dyn Handler>,
    concurrency: usize,
    lock_duration_ms: u64,
    lock_renew_time_ms: u64,
    polling_interval_ms: u64,
    in_flight: Arc<AtomicUsize>,
    shutdown: ShutdownSignal,
}

/// A `Notify`-backed cancellation flag, in the same race-free-wait style
/// as [`crate::pause::PauseGate`].
#[derive(Clone, Default)]
struct ShutdownSignal(Arc<ShutdownInner>);

#[derive(Default)]
struct ShutdownInner {
    notify: tokio::sync::Notify,
    cancelled: std::sync::atomic::AtomicBool,
}

impl ShutdownSignal {
    fn new() -> Self {
        Self::default()
    }

    fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        events: EventBus,
        pause_gate: PauseGate,
        handler: Arc<dyn Handler>,
        concurrency: usize,
        lock_duration_ms: u64,
        lock_renew_time_ms: u64,
        polling_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            events,
            pause_gate,
            handler,
            concurrency,
            lock_duration_ms,
            lock_renew_time_ms,
            polling_interval_ms,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawns `concurrency` independent worker loops, each repeatedly
    /// claiming and processing one job at a time. Returns immediately;
    /// call [`Dispatcher::shutdown`] to stop claiming new work.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.concurrency)
            .map(|slot| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.worker_loop(slot).await })
            })
            .collect()
    }

    /// Signals every worker loop to stop claiming new jobs after its
    /// current one finishes. Does not forcibly interrupt in-flight
    /// handlers — pair with [`Dispatcher::in_flight_count`] to wait out
    /// graceful drains.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn worker_loop(self: Arc<Self>, slot: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            self.pause_gate.wait_until_resumed().await;

            let claimed = tokio::select! {
                claimed = self.store.claim_next(self.polling_interval_ms) => claimed,
                _ = self.shutdown.cancelled() => return,
            };

            let claimed = match claimed {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    self.events
                        .publish(Event::new(EventKind::NoJobRetrieved, "", Origin::Local));
                    continue;
                }
                Err(err) => {
                    warn!(slot, error = %err, "claim_next failed, backing off");
                    self.events.publish(
                        Event::new(EventKind::Error, "", Origin::Local)
                            .with_payload(Value::String(err.to_string())),
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(self.polling_interval_ms))
                        .await;
                    continue;
                }
            };

            self.process_claimed(claimed).await;
        }
    }

    #[instrument(skip(self, claimed), fields(job_id = %claimed.job.id))]
    async fn process_claimed(&self, claimed: crate::job::ClaimedJob) {
        let job_id = claimed.job.id.clone();
        let lock_token = claimed.lock_token.clone();

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.events
            .publish(Event::new(EventKind::Active, job_id.clone(), Origin::Local));

        let renewer = lock::spawn(
            Arc::clone(&self.store),
            job_id.clone(),
            lock_token.clone(),
            self.lock_renew_time_ms,
            self.lock_duration_ms,
        );

        let timeout_ms = claimed.job.opts.timeout;
        let job = Job::new(
            claimed.job.id.clone(),
            claimed.job.data.clone(),
            claimed.job.opts.clone(),
            Arc::clone(&self.store),
        );

        let outcome = match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(
                    std::time::Duration::from_millis(ms),
                    self.handler.handle(job),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "handler exceeded its {ms}ms timeout"
                    )),
                }
            }
            None => self.handler.handle(job).await,
        };
        renewer.stop();

        match outcome {
            Ok(result) => {
                match self
                    .store
                    .move_to_completed(&job_id, &lock_token, result.clone())
                    .await
                {
                    Ok(()) => {
                        info!(job_id = %job_id, "job completed");
                        self.events.publish(
                            Event::new(EventKind::Completed, job_id, Origin::Local)
                                .with_payload(result),
                        );
                    }
                    Err(err) => {
                        error!(job_id = %job_id, error = %err, "failed to record completion");
                        self.events.publish(
                            Event::new(EventKind::Error, job_id.clone(), Origin::Local)
                                .with_payload(Value::String(err.to_string())),
                        );
                    }
                }
            }
            Err(err) => {
                let reason = err.to_string();
                let stacktrace = vec![format!("{err:?}")];
                match self
                    .store
                    .move_to_failed(
                        &job_id,
                        &lock_token,
                        FailureKind::Retryable,
                        reason.clone(),
                        stacktrace,
                    )
                    .await
                {
                    Ok(()) => {
                        warn!(job_id = %job_id, reason = %reason, "job failed");
                        self.events.publish(
                            Event::new(EventKind::Failed, job_id, Origin::Local)
                                .with_payload(Value::String(reason)),
                        );
                    }
                    Err(store_err) => {
                        error!(job_id = %job_id, error = %store_err, "failed to record failure");
                        self.events.publish(
                            Event::new(EventKind::Error, job_id.clone(), Origin::Local)
                                .with_payload(Value::String(store_err.to_string())),
                        );
                    }
                }
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        CleanCollection, ClaimedJobData, JobCountsRaw, JobListCollection, JobOpts, JobRecord,
        StalledReport,
    };
    use tokio::sync::Mutex as AsyncMutex;

    /// Records whatever `move_to_completed`/`move_to_failed` was called
    /// with so a test can assert on the dispatcher's reported outcome.
    struct RecordingStore {
        claimed: AsyncMutex<Option<ClaimedJob>>,
        failure_reason: AsyncMutex<Option<String>>,
    }

    #[async_trait]
    impl JobStore for RecordingStore {
        async fn add_job(&self, _: Value, _: JobOpts) -> Result<String, crate::QueueError> {
            unimplemented!()
        }
        async fn claim_next(&self, _: u64) -> Result<Option<ClaimedJob>, crate::QueueError> {
            Ok(self.claimed.lock().await.take())
        }
        async fn renew_lock(&self, _: &str, _: &str, _: u64) -> Result<(), crate::QueueError> {
            Ok(())
        }
        async fn update_progress(&self, _: &str, _: Value) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn move_to_completed(&self, _: &str, _: &str, _: Value) -> Result<(), crate::QueueError> {
            panic!("a handler that exceeds its timeout must not report completed");
        }
        async fn move_to_failed(
            &self,
            _: &str,
            _: &str,
            _: FailureKind,
            reason: String,
            _: Vec<String>,
        ) -> Result<(), crate::QueueError> {
            *self.failure_reason.lock().await = Some(reason);
            Ok(())
        }
        async fn promote_delayed(&self) -> Result<Option<i64>, crate::QueueError> {
            unimplemented!()
        }
        async fn reap_stalled(&self, _: u32) -> Result<StalledReport, crate::QueueError> {
            unimplemented!()
        }
        async fn pause(&self) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn resume(&self) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn is_paused(&self) -> Result<bool, crate::QueueError> {
            Ok(false)
        }
        async fn get_job(&self, _: &str) -> Result<Option<JobRecord>, crate::QueueError> {
            unimplemented!()
        }
        async fn counts(&self) -> Result<JobCountsRaw, crate::QueueError> {
            unimplemented!()
        }
        async fn list_ids(&self, _: JobListCollection) -> Result<Vec<String>, crate::QueueError> {
            unimplemented!()
        }
        async fn clean(
            &self,
            _: CleanCollection,
            _: i64,
            _: Option<usize>,
        ) -> Result<Vec<String>, crate::QueueError> {
            unimplemented!()
        }
        async fn empty(&self) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        fn delay_notify(&self) -> Arc<tokio::sync::Notify> {
            Arc::new(tokio::sync::Notify::new())
        }
        fn pause_notify(&self) -> Arc<tokio::sync::Notify> {
            Arc::new(tokio::sync::Notify::new())
        }
    }

    #[tokio::test]
    async fn a_handler_past_its_timeout_is_reported_failed_quickly() {
        let opts = JobOpts {
            timeout: Some(50),
            ..Default::default()
        };
        let claimed = ClaimedJob {
            job: ClaimedJobData {
                id: "1".to_string(),
                data: Value::Null,
                opts,
                attempts_made: 0,
                timestamp: 0,
            },
            lock_token: "token".to_string(),
        };
        let store = Arc::new(RecordingStore {
            claimed: AsyncMutex::new(Some(claimed)),
            failure_reason: AsyncMutex::new(None),
        });

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            EventBus::new(),
            PauseGate::new(false),
            Arc::new(|_job: Job| async move {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                Ok(Value::Null)
            }),
            1,
            5_000,
            2_500,
            50,
        ));

        let claimed = store.claim_next(0).await.unwrap().unwrap();
        tokio::time::timeout(
            std::time::Duration::from_millis(200),
            dispatcher.process_claimed(claimed),
        )
        .await
        .expect("dispatcher should report failure well within the sleeping handler's 500ms");

        let reason = store.failure_reason.lock().await.clone();
        assert!(reason.unwrap().contains("timeout"));
    }
}
