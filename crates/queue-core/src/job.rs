//! The job entity and the [`JobStore`] seam a concrete backend implements.
//!
//! Everything in this module is policy-light: it describes *what* a job
//! looks like and *what operations* a store must support, not how any one
//! backend performs them. [`crate::Queue`] is generic over `Arc<dyn
//! JobStore>` so tests can swap in an in-memory fake without touching Redis.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MAX_TIMEOUT_MS;
use crate::error::QueueError;

/// Per-job options supplied at `add()` time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOpts {
    /// Milliseconds to wait before the job becomes eligible to run.
    #[serde(default)]
    pub delay: i64,

    /// Higher runs first among ready jobs. Zero means unprioritized, and
    /// unprioritized jobs are preferred over any prioritized one — matching
    /// the distilled spec's `priority` semantics.
    #[serde(default)]
    pub priority: i64,

    /// Total attempts allowed, including the first. `1` means no retries.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default)]
    pub backoff: Option<Backoff>,

    /// If false, the payload is dropped from `completed` as soon as the
    /// handler succeeds rather than left for inspection.
    #[serde(default = "default_true")]
    pub remove_on_complete: bool,

    #[serde(default)]
    pub remove_on_fail: bool,

    /// Caller-supplied job id. Omit to let the store assign one from its
    /// internal id counter.
    #[serde(default)]
    pub job_id: Option<String>,

    /// Milliseconds the handler is allowed to run before the dispatcher
    /// races it against `tokio::time::timeout` and reports a failure.
    /// `None` means the handler runs to completion unbounded.
    #[serde(default)]
    pub timeout: Option<u64>,
}

const fn default_attempts() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

impl Default for JobOpts {
    fn default() -> Self {
        Self {
            delay: 0,
            priority: 0,
            attempts: default_attempts(),
            backoff: None,
            remove_on_complete: true,
            remove_on_fail: false,
            job_id: None,
            timeout: None,
        }
    }
}

impl JobOpts {
    /// Delay clamped to the range a single timer tick can represent.
    pub fn clamped_delay(&self) -> i64 {
        self.delay.clamp(0, MAX_TIMEOUT_MS)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: i64 },
    Exponential { delay_ms: i64 },
}

impl Backoff {
    /// Delay before the `attempt`-th retry (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> i64 {
        match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { delay_ms } => {
                delay_ms.saturating_mul(2i64.saturating_pow(attempt.saturating_sub(1)))
            }
        }
    }
}

/// A job record as persisted by the store.
///
/// Holds a handle back to the store so callers can update progress or
/// re-read fresh state without the caller threading a store reference
/// through every function that accepts a `Job`.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub data: Value,
    pub opts: JobOpts,
    pub progress: Value,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    pub return_value: Option<Value>,
    pub timestamp: i64,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    store: Arc<dyn JobStore>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("attempts_made", &self.attempts_made)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(id: String, data: Value, opts: JobOpts, store: Arc<dyn JobStore>) -> Self {
        Self {
            id,
            data,
            opts,
            progress: Value::Null,
            attempts_made: 0,
            failed_reason: None,
            stacktrace: Vec::new(),
            return_value: None,
            timestamp: Utc::now().timestamp_millis(),
            processed_on: None,
            finished_on: None,
            store,
        }
    }

    /// Rehydrates a full `Job` from a plain [`JobRecord`] plus the store
    /// handle that looked it up. Kept separate from `JobStore::get_job`
    /// itself so the trait's return type never needs to name `Arc<dyn
    /// JobStore>` — only [`crate::Queue`], which already holds that
    /// handle, does the wrapping.
    pub fn from_record(record: JobRecord, store: Arc<dyn JobStore>) -> Self {
        Self {
            id: record.id,
            data: record.data,
            opts: record.opts,
            progress: record.progress,
            attempts_made: record.attempts_made,
            failed_reason: record.failed_reason,
            stacktrace: record.stacktrace,
            return_value: record.return_value,
            timestamp: record.timestamp,
            processed_on: record.processed_on,
            finished_on: record.finished_on,
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reports progress back to the store. Fire-and-log: a lost progress
    /// update never fails the handler.
    pub async fn update_progress(&self, progress: Value) -> Result<(), QueueError> {
        self.store.update_progress(&self.id, progress).await
    }
}

/// Every field of [`Job`] except the store handle. What a backend hands
/// back from a lookup; [`Job::from_record`] is what turns it into a
/// fully-usable `Job`.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub data: Value,
    pub opts: JobOpts,
    pub progress: Value,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    pub return_value: Option<Value>,
    pub timestamp: i64,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
}

/// A job handed to the dispatcher by [`JobStore::claim_next`], paired with
/// the lock token the dispatcher must present to release or renew it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: ClaimedJobData,
    pub lock_token: String,
}

/// The subset of job fields a store returns on claim, before the
/// dispatcher wraps it in a [`Job`] bound to the store handle.
#[derive(Debug, Clone)]
pub struct ClaimedJobData {
    pub id: String,
    pub data: Value,
    pub opts: JobOpts,
    pub attempts_made: u32,
    pub timestamp: i64,
}

/// Why a deserialized handler payload or store row was rejected.
#[derive(Debug, thiserror::Error)]
#[error("failed to deserialize job field `{field}`: {source}")]
pub struct DeserializationError {
    pub field: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Classifies a handler failure for the store's retry decision.
///
/// The dispatcher cannot see inside an opaque `anyhow::Error`, so every
/// handler failure is reported as `Retryable`; the store is the one place
/// that knows `attempts_made` vs `opts.attempts` and makes the actual
/// retry-vs-dead-letter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// Everything a backend must provide for [`crate::Queue`] to drive the
/// wait → active → completed/failed state machine.
///
/// Implemented by `queue-redis`'s `RedisJobStore` for production use and
/// by `queue-testing`'s `FakeJobStore` for tests that don't need a live
/// Redis instance.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Adds a new job, routing it into `paused` instead of `wait` if the
    /// queue is currently paused. Returns the assigned job id.
    async fn add_job(&self, data: Value, opts: JobOpts) -> Result<String, QueueError>;

    /// Blocks (up to `timeout_ms`) for the next ready job and atomically
    /// moves it into `active` under a fresh lock. Returns `None` on
    /// timeout with nothing ready.
    async fn claim_next(&self, timeout_ms: u64) -> Result<Option<ClaimedJob>, QueueError>;

    /// Extends the job's lock TTL. Fails with [`QueueError::LockLost`] if
    /// the token no longer matches what's stored (another worker reaped
    /// and reclaimed it).
    async fn renew_lock(&self, job_id: &str, lock_token: &str, ttl_ms: u64)
        -> Result<(), QueueError>;

    async fn update_progress(&self, job_id: &str, progress: Value) -> Result<(), QueueError>;

    /// Moves a job from `active` to `completed`, releasing its lock.
    async fn move_to_completed(
        &self,
        job_id: &str,
        lock_token: &str,
        return_value: Value,
    ) -> Result<(), QueueError>;

    /// Moves a job out of `active` after a handler failure. Internally
    /// decides retry (back into `wait`/`delayed` with backoff) vs
    /// dead-letter (`failed`) by comparing `attempts_made` to
    /// `opts.attempts`.
    async fn move_to_failed(
        &self,
        job_id: &str,
        lock_token: &str,
        kind: FailureKind,
        reason: String,
        stacktrace: Vec<String>,
    ) -> Result<(), QueueError>;

    /// Scans `delayed` and promotes every entry whose score has elapsed
    /// into `wait` (or `priority`). Returns the next delayed score still
    /// in the future, if any, so the delay controller knows when to wake.
    async fn promote_delayed(&self) -> Result<Option<i64>, QueueError>;

    /// Sweeps `active` for jobs whose lock has expired: up to
    /// `max_stalled_count` retries send them back to `wait`, beyond that
    /// they go straight to `failed`.
    async fn reap_stalled(&self, max_stalled_count: u32) -> Result<StalledReport, QueueError>;

    async fn pause(&self) -> Result<(), QueueError>;
    async fn resume(&self) -> Result<(), QueueError>;
    async fn is_paused(&self) -> Result<bool, QueueError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn counts(&self) -> Result<JobCountsRaw, QueueError>;

    /// Lists every id currently sitting in `collection`, in no particular
    /// order. Backs [`crate::queue::Queue::waiting`]/`active`/`delayed`/
    /// `completed`/`failed`, which load each id into a full [`Job`]
    /// afterward.
    async fn list_ids(&self, collection: JobListCollection) -> Result<Vec<String>, QueueError>;

    /// Removes finished jobs older than `grace_ms` from `completed` or
    /// `failed`, returning the ids removed.
    async fn clean(
        &self,
        collection: CleanCollection,
        grace_ms: i64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, QueueError>;

    /// Empties `wait`, `paused`, `delayed`, and `priority` without
    /// touching `active`, `completed`, or `failed`.
    async fn empty(&self) -> Result<(), QueueError>;

    /// A shared handle the delay controller awaits between polls.
    ///
    /// A store backed by real pub/sub should notify it the moment a new
    /// delayed job is added anywhere in the cluster, letting the
    /// controller wake immediately instead of waiting out the guardian
    /// interval. A store with no such channel can return a `Notify` that's
    /// simply never signaled — the guardian poll still covers correctness,
    /// just without the low-latency fast path.
    fn delay_notify(&self) -> Arc<tokio::sync::Notify>;

    /// A shared handle fired whenever another process flips `meta-paused`.
    ///
    /// Lets [`crate::queue::Queue`] keep its local `PauseGate` in sync with
    /// a pause or resume issued by a different process, instead of only
    /// reflecting pause calls made through this same `Queue` handle. A
    /// store with no cross-process channel can return a `Notify` that's
    /// never signaled; callers should still poll `is_paused` themselves
    /// when they need the authoritative answer.
    fn pause_notify(&self) -> Arc<tokio::sync::Notify>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanCollection {
    Completed,
    Failed,
}

impl CleanCollection {
    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidCleanType(other.to_string())),
        }
    }
}

/// The collections [`JobStore::list_ids`] can list.
///
/// `Waiting` is the concatenation of `wait` and `paused`, matching the
/// distilled spec's `waiting()` operation — jobs parked behind a pause are
/// still "waiting" from a caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobListCollection {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// Per-id outcome of one [`JobStore::reap_stalled`] sweep: which ids went
/// back to `wait` for another attempt, and which exceeded the stall limit
/// and were moved straight to `failed`. The reaper loads each id into a
/// full [`Job`] and emits one `Stalled`/`Failed` event per entry, rather
/// than an aggregate count.
#[derive(Debug, Clone, Default)]
pub struct StalledReport {
    pub recovered: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobCountsRaw {
    pub wait: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let b = Backoff::Exponential { delay_ms: 1_000 };
        assert_eq!(b.delay_for_attempt(1), 1_000);
        assert_eq!(b.delay_for_attempt(2), 2_000);
        assert_eq!(b.delay_for_attempt(3), 4_000);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let b = Backoff::Fixed { delay_ms: 500 };
        assert_eq!(b.delay_for_attempt(1), 500);
        assert_eq!(b.delay_for_attempt(5), 500);
    }

    #[test]
    fn delay_is_clamped_to_max_timeout() {
        let opts = JobOpts {
            delay: i64::MAX,
            ..Default::default()
        };
        assert_eq!(opts.clamped_delay(), MAX_TIMEOUT_MS);
    }

    #[test]
    fn clean_collection_rejects_unknown_names() {
        assert!(CleanCollection::parse("wait").is_err());
        assert!(CleanCollection::parse("completed").is_ok());
    }
}
