//! # queue-core
//!
//! The worker-side coordination engine of a Redis-backed distributed job
//! queue: at-least-once delivery, bounded per-worker concurrency, delayed
//! jobs, priorities, retries, and crash recovery via distributed locks and
//! a stalled-job reaper.
//!
//! ## Core Concepts
//!
//! A [`Queue`] owns three independent Redis sessions (general, blocking,
//! subscriber) and moves job ids across six collections:
//!
//! ```text
//! producer ──add()──> wait ──(delay expires)── delayed
//!                       │
//!                       ▼ BRPOPLPUSH
//!                     active ──handler ok──> completed
//!                       │
//!                       └──handler err──> failed
//!
//! reaper sweeps `active`: unlocked entries return to `wait`, or to
//! `failed` once MAX_STALLED_JOB_COUNT is exceeded.
//! ```
//!
//! ## Key Invariants
//!
//! 1. A job id is in at most one of {wait, paused, active, completed,
//!    failed} at any instant.
//! 2. A job id in `active` implies its payload record exists.
//! 3. The delay controller's armed timestamp never trails the minimum
//!    score in `delayed` for longer than one guardian tick.
//! 4. `meta-paused` existence is equivalent to producers routing new ids
//!    into `paused` rather than `wait`.
//! 5. A job under active processing holds `<job-id>:lock` with a token
//!    unique to its worker for the handler's whole lifetime.
//!
//! ## Example
//!
//! ```ignore
//! use queue_core::{Queue, QueueConfig, JobOpts};
//! use queue_redis::RedisJobStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(RedisJobStore::connect(&config).await?);
//! let queue = Queue::connect(QueueConfig::from_url("redis://localhost/0"), store).await?;
//!
//! queue.process(4, |job| async move {
//!     println!("processing {}", job.id());
//!     Ok(serde_json::json!({ "ok": true }))
//! }).await?;
//!
//! queue.add(serde_json::json!({ "to": "alice@example.com" }), JobOpts::default()).await?;
//! ```
//!
//! ## What This Is Not
//!
//! queue-core is **not**:
//! - A general event-sourcing or saga framework
//! - A scheduler for cron-style recurring jobs
//! - A multi-backend abstraction (it is a Redis engine; the [`job::JobStore`]
//!   seam exists so the engine can be driven in tests without a live Redis,
//!   not to support other databases)
//!
//! queue-core **is**:
//! > the coordination engine that makes at-least-once, crash-recoverable
//! > job processing correct on top of one Redis instance.

mod config;
mod delay;
mod dispatch;
mod error;
mod events;
mod keys;
mod lock;
mod pause;
mod queue;
mod reaper;
mod timer;

/// The four collection-level atomic scripts (delay promotion, cleanup,
/// pause/resume) that a [`job::JobStore`] implementation invokes against
/// its own connection. Per-job scripts are the store's own business and
/// live with the implementation, not here.
pub mod scripts;

// Job interfaces (policy-light: the seam an external store implements)
pub mod job;

#[cfg(test)]
mod tests;

// Re-export configuration types
pub use config::{QueueConfig, RedlockConfig};

// Re-export error types
pub use error::QueueError;

// Re-export event types
pub use events::{Event, EventBus, EventKind};

// Re-export key naming
pub use keys::KeyNamer;

// Re-export job types (the seam external storage is assumed to fill)
pub use job::{ClaimedJob, DeserializationError, FailureKind, Job, JobOpts, JobRecord, JobStore};

// Re-export dispatcher types
pub use dispatch::{Dispatcher, Handler, HandlerError};

// Re-export the primary entry point
pub use queue::{JobCounts, Queue, QueueBuilder};

// Re-export commonly used external types
pub use async_trait::async_trait;
