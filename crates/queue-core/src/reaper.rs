//! Periodically sweeps `active` for jobs whose lock expired without being
//! renewed — a crashed worker, a handler that blocked past its lock TTL.
//!
//! Unlike the delay controller this has no low-latency fast path: a
//! stalled job is already late by definition, so a fixed poll on
//! `stalled_check_interval_ms` is all the distilled spec asks for. Set the
//! interval to zero to disable the reaper entirely (single-process setups
//! that don't expect crashes mid-job may not want the extra Redis calls).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::events::{Event, EventBus, EventKind, Origin};
use crate::job::JobStore;

pub struct ReaperHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ReaperHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

pub fn spawn(
    store: Arc<dyn JobStore>,
    events: EventBus,
    interval_ms: u64,
    max_stalled_count: u32,
) -> Option<ReaperHandle> {
    if interval_ms == 0 {
        return None;
    }

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match store.reap_stalled(max_stalled_count).await {
                Ok(report) if !report.recovered.is_empty() || !report.failed.is_empty() => {
                    info!(
                        recovered = report.recovered.len(),
                        failed = report.failed.len(),
                        "reclaimed stalled jobs"
                    );
                    for job_id in &report.recovered {
                        if let Err(err) = store.get_job(job_id).await {
                            warn!(job_id = %job_id, error = %err, "failed to load recovered job before emitting event");
                        }
                        events.publish(Event::new(EventKind::Stalled, job_id.clone(), Origin::Local));
                    }
                    for job_id in &report.failed {
                        if let Err(err) = store.get_job(job_id).await {
                            warn!(job_id = %job_id, error = %err, "failed to load failed job before emitting event");
                        }
                        events.publish(
                            Event::new(EventKind::Failed, job_id.clone(), Origin::Local).with_payload(
                                Value::String("job stalled more than allowable limit".to_string()),
                            ),
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "stalled-job sweep failed");
                    events.publish(
                        Event::new(EventKind::Error, "", Origin::Local)
                            .with_payload(Value::String(err.to_string())),
                    );
                }
            }
        }
    });

    Some(ReaperHandle { task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        CleanCollection, ClaimedJob, FailureKind, JobCountsRaw, JobListCollection, JobOpts,
        JobRecord, StalledReport,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ReapingStore {
        sweeps: AtomicU32,
    }

    #[async_trait]
    impl JobStore for ReapingStore {
        async fn add_job(&self, _: Value, _: JobOpts) -> Result<String, crate::QueueError> {
            unimplemented!()
        }
        async fn claim_next(&self, _: u64) -> Result<Option<ClaimedJob>, crate::QueueError> {
            unimplemented!()
        }
        async fn renew_lock(&self, _: &str, _: &str, _: u64) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn update_progress(&self, _: &str, _: Value) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn move_to_completed(
            &self,
            _: &str,
            _: &str,
            _: Value,
        ) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn move_to_failed(
            &self,
            _: &str,
            _: &str,
            _: FailureKind,
            _: String,
            _: Vec<String>,
        ) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn promote_delayed(&self) -> Result<Option<i64>, crate::QueueError> {
            unimplemented!()
        }
        async fn reap_stalled(&self, _: u32) -> Result<StalledReport, crate::QueueError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Ok(StalledReport {
                recovered: vec!["1".to_string()],
                failed: Vec::new(),
            })
        }
        async fn pause(&self) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn resume(&self) -> Result<(), crate::QueueError> {
            unimplemented!()
        }
        async fn is_paused(&self) -> Result<bool, crate::QueueError> {
            unimplemented!()
        }
        async fn get_job(&self, job_id: &str) -> Result<Option<crate::job::JobRecord>, crate::QueueError> {
            Ok(Some(JobRecord {
                id: job_id.to_string(),
                data: Value::Null,
                opts: JobOpts::default(),
                progress: Value::Null,
                attempts_made: 0,
                failed_reason: None,
                stacktrace: Vec::new(),
                return_value: None,
                timestamp: 0,
                processed_on: None,
                finished_on: None,
            }))
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

    #[test]
    fn zero_interval_disables_the_reaper() {
        let store: Arc<dyn JobStore> = Arc::new(ReapingStore {
            sweeps: AtomicU32::new(0),
        });
        assert!(spawn(store, EventBus::new(), 0, 1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_emits_a_stalled_event_per_recovered_id() {
        let store = Arc::new(ReapingStore {
            sweeps: AtomicU32::new(0),
        });
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let handle = spawn(store, events, 50, 1).expect("enabled");

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;

        let event = rx.try_recv().expect("a stalled event was published");
        assert_eq!(event.kind, EventKind::Stalled);
        assert_eq!(event.job_id, "1");

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_every_tick() {
        let store = Arc::new(ReapingStore {
            sweeps: AtomicU32::new(0),
        });
        let handle = spawn(store.clone(), EventBus::new(), 50, 1).expect("enabled");

        tokio::time::advance(Duration::from_millis(220)).await;
        tokio::task::yield_now().await;

        handle.stop();
        assert!(store.sweeps.load(Ordering::SeqCst) >= 3);
    }
}
