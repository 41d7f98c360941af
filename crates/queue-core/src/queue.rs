//! The public entry point: [`Queue`] ties the job store, event bus, pause
//! gate, delay controller, and reaper together behind one handle cheap
//! enough to clone and share across tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::QueueConfig;
use crate::delay::{self, DelayControllerHandle};
use crate::dispatch::{Dispatcher, Handler};
use crate::error::QueueError;
use crate::events::{Event, EventBus, EventKind, Origin};
use crate::job::{CleanCollection, Job, JobListCollection, JobOpts, JobStore};
use crate::pause::PauseGate;
use crate::reaper::{self, ReaperHandle};

/// Point-in-time counts across every collection, as returned by
/// [`Queue::job_counts`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
}

struct Background {
    delay: DelayControllerHandle,
    reaper: Option<ReaperHandle>,
    pause_sync: tokio::task::JoinHandle<()>,
}

/// Watches [`JobStore::pause_notify`] and mirrors any pause/resume another
/// process makes into this process's local [`PauseGate`] — the gate a
/// blocked `BRPOPLPUSH` loop can't otherwise notice until its call returns.
fn spawn_pause_sync(
    store: Arc<dyn JobStore>,
    pause_gate: PauseGate,
    events: EventBus,
) -> tokio::task::JoinHandle<()> {
    let wake = store.pause_notify();
    tokio::spawn(async move {
        loop {
            wake.notified().await;
            match store.is_paused().await {
                Ok(is_paused) if is_paused != pause_gate.is_paused() => {
                    if is_paused {
                        pause_gate.pause();
                        events.publish(Event::new(EventKind::Paused, "", Origin::Remote));
                    } else {
                        pause_gate.resume();
                        events.publish(Event::new(EventKind::Resumed, "", Origin::Remote));
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "failed to re-check pause state after notify");
                }
            }
        }
    })
}

struct QueueInner {
    store: Arc<dyn JobStore>,
    events: EventBus,
    pause_gate: PauseGate,
    config: QueueConfig,
    dispatcher: std::sync::Mutex<Option<Arc<Dispatcher>>>,
    background: std::sync::Mutex<Option<Background>>,
    closed: AtomicBool,
}

/// A handle to one named queue. Cheap to clone — every clone shares the
/// same background tasks and store connection.
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

/// Building-block used by [`Queue::connect`] when callers want to tweak
/// defaults before the delay controller and reaper start.
pub struct QueueBuilder {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
}

impl QueueBuilder {
    pub fn new(config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self { config, store }
    }

    pub async fn build(self) -> Result<Queue, QueueError> {
        let paused = self.store.is_paused().await?;
        let events = EventBus::new();
        let pause_gate = PauseGate::new(paused);

        let delay = delay::spawn(Arc::clone(&self.store), self.config.polling_interval_ms);
        let reaper = reaper::spawn(
            Arc::clone(&self.store),
            events.clone(),
            self.config.stalled_check_interval_ms,
            self.config.max_stalled_count,
        );
        let pause_sync = spawn_pause_sync(Arc::clone(&self.store), pause_gate.clone(), events.clone());

        // Every connection this store needs (ordinary commands, the
        // blocking pop, the pub/sub listeners) was already proven live
        // during `JobStore::connect`/construction above, so by the time a
        // caller holds a `Queue` it's always ready — there's no separate
        // async milestone to wait for the way a three-connection-handshake
        // client would have. `is_ready` and this event exist so callers
        // written against that handshake still have something to await.
        events.publish(Event::new(EventKind::Ready, "", Origin::Local));

        Ok(Queue(Arc::new(QueueInner {
            store: self.store,
            events,
            pause_gate,
            config: self.config,
            dispatcher: std::sync::Mutex::new(None),
            background: std::sync::Mutex::new(Some(Background {
                delay,
                reaper,
                pause_sync,
            })),
            closed: AtomicBool::new(false),
        })))
    }
}

impl Queue {
    pub async fn connect(config: QueueConfig, store: Arc<dyn JobStore>) -> Result<Self, QueueError> {
        QueueBuilder::new(config, store).build().await
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Enqueues a new job. Returns its assigned id.
    pub async fn add(&self, data: Value, opts: JobOpts) -> Result<String, QueueError> {
        self.ensure_open()?;
        let id = self.0.store.add_job(data, opts).await?;
        self.0
            .events
            .publish(Event::new(EventKind::Waiting, id.clone(), Origin::Local));
        Ok(id)
    }

    /// Installs the job handler and starts `concurrency` worker loops.
    /// May only be called once per `Queue`.
    pub async fn process<H>(&self, concurrency: usize, handler: H) -> Result<(), QueueError>
    where
        H: Handler,
    {
        self.ensure_open()?;
        let mut guard = self.0.dispatcher.lock().expect("dispatcher mutex poisoned");
        if guard.is_some() {
            return Err(QueueError::HandlerAlreadyInstalled);
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.0.store),
            self.0.events.clone(),
            self.0.pause_gate.clone(),
            Arc::new(handler),
            concurrency.max(1),
            self.0.config.lock_duration_ms,
            self.0.config.lock_renew_time_ms,
            self.0.config.polling_interval_ms,
        ));
        dispatcher.spawn_workers();
        *guard = Some(dispatcher);

        info!(concurrency, "started processing");
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.0.store.pause().await?;
        self.0.pause_gate.pause();
        self.0
            .events
            .publish(Event::new(EventKind::Paused, "", Origin::Local));
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.0.store.resume().await?;
        self.0.pause_gate.resume();
        self.0
            .events
            .publish(Event::new(EventKind::Resumed, "", Origin::Local));
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        self.0.store.is_paused().await
    }

    /// Always resolves immediately: every connection this queue needs was
    /// already established before `connect`/`build` returned. Kept for
    /// callers written against the handshake-style readiness protocol.
    pub async fn is_ready(&self) -> Result<(), QueueError> {
        self.ensure_open()
    }

    /// `max(len(wait), len(paused)) + len(delayed)` — the distilled
    /// spec's definition of a queue's total pending size, counting a
    /// paused queue's backlog instead of double-counting it against an
    /// empty `wait`.
    pub async fn count(&self) -> Result<u64, QueueError> {
        let raw = self.0.store.counts().await?;
        Ok(raw.wait.max(raw.paused) + raw.delayed)
    }

    async fn list_jobs(&self, collection: JobListCollection) -> Result<Vec<Job>, QueueError> {
        let ids = self.0.store.list_ids(collection).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.0.store.get_job(&id).await? {
                jobs.push(Job::from_record(record, Arc::clone(&self.0.store)));
            }
        }
        Ok(jobs)
    }

    pub async fn waiting(&self) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(JobListCollection::Waiting).await
    }

    pub async fn active(&self) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(JobListCollection::Active).await
    }

    pub async fn delayed(&self) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(JobListCollection::Delayed).await
    }

    pub async fn completed(&self) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(JobListCollection::Completed).await
    }

    pub async fn failed(&self) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(JobListCollection::Failed).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let record = self.0.store.get_job(job_id).await?;
        Ok(record.map(|record| Job::from_record(record, Arc::clone(&self.0.store))))
    }

    pub async fn job_counts(&self) -> Result<JobCounts, QueueError> {
        let raw = self.0.store.counts().await?;
        Ok(JobCounts {
            waiting: raw.wait,
            active: raw.active,
            delayed: raw.delayed,
            completed: raw.completed,
            failed: raw.failed,
            paused: raw.paused,
        })
    }

    /// Removes finished jobs older than `grace` from `completed` or
    /// `failed`. `limit` caps how many are removed in one call.
    pub async fn clean(
        &self,
        collection: &str,
        grace: Duration,
        limit: Option<usize>,
    ) -> Result<Vec<String>, QueueError> {
        let collection = CleanCollection::parse(collection)?;
        let removed = self
            .0
            .store
            .clean(collection, grace.as_millis() as i64, limit)
            .await?;
        if !removed.is_empty() {
            self.0.events.publish(
                Event::new(EventKind::Cleaned, "", Origin::Local)
                    .with_payload(Value::from(removed.clone())),
            );
        }
        Ok(removed)
    }

    /// Empties `wait`, `paused`, `delayed`, and `priority`, leaving
    /// in-flight and finished jobs untouched.
    pub async fn empty(&self) -> Result<(), QueueError> {
        self.0.store.empty().await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.0.events.subscribe()
    }

    /// The number of jobs currently being handled by this process's
    /// worker loops.
    pub fn in_flight_count(&self) -> usize {
        self.0
            .dispatcher
            .lock()
            .expect("dispatcher mutex poisoned")
            .as_ref()
            .map(|d| d.in_flight_count())
            .unwrap_or(0)
    }

    /// Waits (bounded by `timeout`) for every handler this process started
    /// to finish, polling rather than blocking on a single notification
    /// since completion is reported by an atomic counter, not an event.
    pub async fn when_current_jobs_finished(&self, timeout: Duration) -> Result<(), QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    /// Stops claiming new jobs, then — unless `do_not_wait_jobs` is set —
    /// waits out in-flight handlers up to `config.client_close_timeout_ms`
    /// before tearing down background tasks. Idempotent.
    pub async fn close(&self, do_not_wait_jobs: bool) -> Result<(), QueueError> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(dispatcher) = self.0.dispatcher.lock().expect("dispatcher mutex poisoned").take()
        {
            dispatcher.shutdown();
        }

        if !do_not_wait_jobs {
            let timeout = Duration::from_millis(self.0.config.client_close_timeout_ms);
            self.when_current_jobs_finished(timeout).await?;
        }

        if let Some(background) = self.0.background.lock().expect("background mutex poisoned").take()
        {
            background.delay.stop();
            if let Some(reaper) = background.reaper {
                reaper.stop();
            }
            background.pause_sync.abort();
        }

        info!("queue closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_counts_default_to_zero() {
        let counts = JobCounts::default();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.failed, 0);
    }
}
