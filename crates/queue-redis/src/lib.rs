//! Redis-backed [`JobStore`] for `queue-core`.
//!
//! The shape mirrors how a SQL-backed store would do it (claim under a
//! row lock, mark outcome, reclaim the expired): `BRPOPLPUSH` plays the
//! role `FOR UPDATE SKIP LOCKED` would, the per-job `<id>:lock` key with a
//! token plays the role of an owner column, and backoff-vs-dead-letter is
//! decided the same way — by comparing `attempts_made` against the job's
//! configured ceiling at failure time, not by anything the handler itself
//! reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use queue_core::job::{
    CleanCollection, ClaimedJob, ClaimedJobData, FailureKind, JobCountsRaw, JobListCollection,
    JobOpts, JobRecord, JobStore, StalledReport,
};
use queue_core::scripts::{CleanJobsInSet, MoveUnlockedJobsToWait, PauseResumeGlobal, UpdateDelaySet};
use queue_core::{KeyNamer, QueueConfig, QueueError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// A connected Redis-backed store for one queue name.
///
/// Holds two independent async connections, matching the distilled
/// architecture's connection trio (minus the dedicated subscriber
/// connection, which lives in [`RedisJobStore::spawn_delay_listener`]):
/// a multiplexed [`ConnectionManager`] for ordinary commands and scripts,
/// and a dedicated connection reserved for `BRPOPLPUSH`, since a blocking
/// call can't share a connection other callers are issuing commands on.
/// Minimum Redis server version this store's scripts and commands are
/// known to need (`BRPOPLPUSH` plus the Lua scripting surface used
/// throughout this file).
const MIN_REDIS_VERSION: &str = "2.8.11";

fn parse_version(version: &str) -> Vec<u32> {
    version.split('.').map(|part| part.parse().unwrap_or(0)).collect()
}

async fn check_server_version(manager: &mut ConnectionManager) -> Result<(), QueueError> {
    let info: String = redis::cmd("INFO")
        .arg("server")
        .query_async(manager)
        .await?;
    let found = info
        .lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .unwrap_or("0.0.0")
        .trim()
        .to_string();

    if parse_version(&found) < parse_version(MIN_REDIS_VERSION) {
        return Err(QueueError::VersionTooOld {
            found,
            required: MIN_REDIS_VERSION,
        });
    }
    Ok(())
}

pub struct RedisJobStore {
    manager: ConnectionManager,
    blocking: Mutex<ConnectionManager>,
    keys: KeyNamer,
    delay_notify: Arc<Notify>,
    pause_notify: Arc<Notify>,
    lock_duration_ms: i64,
    _delay_pubsub_task: tokio::task::JoinHandle<()>,
    _pause_pubsub_task: tokio::task::JoinHandle<()>,
}

impl RedisJobStore {
    pub async fn connect(config: &QueueConfig, queue_name: &str) -> Result<Self, QueueError> {
        let url = config.connection.to_redis_url();
        let client = redis::Client::open(url)?;
        let mut manager = client.get_connection_manager().await?;
        check_server_version(&mut manager).await?;
        let blocking = client.get_connection_manager().await?;

        let keys = KeyNamer::new(config.key_prefix.clone(), queue_name);
        let delay_notify = Arc::new(Notify::new());
        let pause_notify = Arc::new(Notify::new());
        let delay_pubsub_task = Self::spawn_channel_listener(
            client.clone(),
            keys.channel_delayed(),
            Arc::clone(&delay_notify),
        );
        let pause_pubsub_task = Self::spawn_channel_listener(
            client,
            keys.channel_paused(),
            Arc::clone(&pause_notify),
        );

        Ok(Self {
            manager,
            blocking: Mutex::new(blocking),
            keys,
            delay_notify,
            pause_notify,
            lock_duration_ms: config.lock_duration_ms as i64,
            _delay_pubsub_task: delay_pubsub_task,
            _pause_pubsub_task: pause_pubsub_task,
        })
    }

    /// Subscribes to `channel` and fires `notify` on every message
    /// delivered to it, reconnecting on any subscribe or stream failure. A
    /// dropped or never-established subscription just means whichever
    /// guardian poll backs this channel (the delay controller's interval,
    /// or a caller re-checking `is_paused` on its own schedule) carries
    /// correctness alone, without the low-latency fast path.
    fn spawn_channel_listener(
        client: redis::Client,
        channel: String,
        notify: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(err) = pubsub.subscribe(&channel).await {
                            warn!(error = %err, channel, "failed to subscribe to channel");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                        let mut stream = pubsub.on_message();
                        while futures::StreamExt::next(&mut stream).await.is_some() {
                            notify.notify_waiters();
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to open pub/sub connection, retrying");
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
    }

    fn next_job_id_script() -> Script {
        Script::new(
            r#"
            return redis.call('INCR', KEYS[1])
            "#,
        )
    }

    fn add_job_script() -> Script {
        // KEYS: 1 id_counter(unused, id passed in ARGV), 2 job hash key,
        //       3 wait, 4 priority, 5 paused, 6 meta_paused
        // ARGV: 1 id, 2 data, 3 opts(json), 4 priority, 5 timestamp
        Script::new(
            r#"
            local job_key = KEYS[1]
            local wait = KEYS[2]
            local priority_zset = KEYS[3]
            local paused = KEYS[4]
            local meta_paused = KEYS[5]

            local id = ARGV[1]
            redis.call('HSET', job_key,
                'data', ARGV[2],
                'opts', ARGV[3],
                'timestamp', ARGV[5],
                'attemptsMade', '0',
                'priority', ARGV[4])

            local is_paused = redis.call('EXISTS', meta_paused)
            local target
            if is_paused == 1 then
                target = paused
            elseif tonumber(ARGV[4]) > 0 then
                target = priority_zset
            else
                target = wait
            end

            if target == priority_zset then
                redis.call('ZADD', target, ARGV[4], id)
            else
                redis.call('LPUSH', target, id)
            end
            return id
            "#,
        )
    }

    fn add_delayed_script() -> Script {
        // KEYS: 1 job hash key, 2 delayed zset
        // ARGV: 1 id, 2 data, 3 opts(json), 4 timestamp, 5 due_at
        Script::new(
            r#"
            local job_key = KEYS[1]
            local delayed = KEYS[2]
            local id = ARGV[1]

            redis.call('HSET', job_key,
                'data', ARGV[2],
                'opts', ARGV[3],
                'timestamp', ARGV[4],
                'attemptsMade', '0',
                'priority', '0')
            redis.call('ZADD', delayed, ARGV[5], id)
            return id
            "#,
        )
    }

    fn claim_next_script() -> Script {
        // Runs after BRPOPLPUSH has already moved `id` into `active`.
        // KEYS: 1 job hash key, 2 lock key
        // ARGV: 1 lock_token, 2 lock_ttl_ms, 3 id, 4 now
        Script::new(
            r#"
            local job_key = KEYS[1]
            local lock_key = KEYS[2]

            if redis.call('EXISTS', job_key) == 0 then
                return false
            end

            redis.call('SET', lock_key, ARGV[1], 'PX', ARGV[2])
            redis.call('HSET', job_key, 'processedOn', ARGV[4])
            local data = redis.call('HGET', job_key, 'data')
            local opts = redis.call('HGET', job_key, 'opts')
            local attempts = redis.call('HGET', job_key, 'attemptsMade')
            local timestamp = redis.call('HGET', job_key, 'timestamp')
            return {data, opts, attempts, timestamp}
            "#,
        )
    }

    fn renew_lock_script() -> Script {
        Script::new(
            r#"
            local lock_key = KEYS[1]
            local token = ARGV[1]
            local ttl = ARGV[2]
            if redis.call('GET', lock_key) ~= token then
                return 0
            end
            redis.call('PEXPIRE', lock_key, ttl)
            return 1
            "#,
        )
    }

    fn move_to_completed_script() -> Script {
        // KEYS: 1 job_key, 2 lock_key, 3 active, 4 completed
        // ARGV: 1 token, 2 id, 3 return_value, 4 now
        Script::new(
            r#"
            local job_key = KEYS[1]
            local lock_key = KEYS[2]
            local active = KEYS[3]
            local completed = KEYS[4]
            local token = ARGV[1]
            local id = ARGV[2]

            if redis.call('GET', lock_key) ~= token then
                return 0
            end

            redis.call('LREM', active, 0, id)
            redis.call('DEL', lock_key)
            redis.call('HSET', job_key, 'returnValue', ARGV[3], 'finishedOn', ARGV[4])
            redis.call('ZADD', completed, ARGV[4], id)
            return 1
            "#,
        )
    }

    fn move_to_failed_script() -> Script {
        // KEYS: 1 job_key, 2 lock_key, 3 active, 4 failed, 5 wait, 6 delayed
        // ARGV: 1 token, 2 id, 3 reason, 4 stacktrace(json), 5 now,
        //       6 max_attempts, 7 backoff(json or "null")
        Script::new(
            r#"
            local job_key = KEYS[1]
            local lock_key = KEYS[2]
            local active = KEYS[3]
            local failed = KEYS[4]
            local wait = KEYS[5]
            local delayed = KEYS[6]
            local token = ARGV[1]
            local id = ARGV[2]
            local now = tonumber(ARGV[5])
            local max_attempts = tonumber(ARGV[6])

            if redis.call('GET', lock_key) ~= token then
                return {'lockmismatch', 0}
            end

            redis.call('LREM', active, 0, id)
            redis.call('DEL', lock_key)

            local attempts = tonumber(redis.call('HINCRBY', job_key, 'attemptsMade', 1))
            redis.call('HSET', job_key, 'failedReason', ARGV[3], 'stacktrace', ARGV[4])

            if attempts < max_attempts then
                redis.call('HSET', job_key, 'delayUntil', 0)
                return {'retry', attempts}
            else
                redis.call('HSET', job_key, 'finishedOn', now)
                redis.call('ZADD', failed, now, id)
                return {'failed', attempts}
            end
            "#,
        )
    }

    async fn next_job_id(&self, manager: &mut ConnectionManager) -> Result<String, QueueError> {
        let next: i64 = Self::next_job_id_script()
            .key(self.keys.id_counter())
            .invoke_async(manager)
            .await
            .map_err(|source| QueueError::Script {
                name: "next_job_id",
                source,
            })?;
        Ok(next.to_string())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn add_job(&self, data: Value, opts: JobOpts) -> Result<String, QueueError> {
        let mut manager = self.manager.clone();
        let id = match &opts.job_id {
            Some(id) => id.clone(),
            None => self.next_job_id(&mut manager).await?,
        };

        let now = Utc::now().timestamp_millis();
        let data_json = serde_json::to_string(&data)?;
        let opts_json = serde_json::to_string(&opts)?;
        let delay = opts.clamped_delay();

        if delay > 0 {
            let due_at = now + delay;
            let _: () = Self::add_delayed_script()
                .key(self.keys.job(&id))
                .key(self.keys.delayed())
                .arg(&id)
                .arg(&data_json)
                .arg(&opts_json)
                .arg(now)
                .arg(due_at)
                .invoke_async(&mut manager)
                .await
                .map_err(|source| QueueError::Script {
                    name: "add_delayed",
                    source,
                })?;
            let _: Result<i64, _> = manager
                .publish(self.keys.channel_delayed(), due_at)
                .await;
        } else {
            let _: () = Self::add_job_script()
                .key(self.keys.job(&id))
                .key(self.keys.wait())
                .key(self.keys.priority())
                .key(self.keys.paused())
                .key(self.keys.meta_paused())
                .arg(&id)
                .arg(&data_json)
                .arg(&opts_json)
                .arg(opts.priority)
                .arg(now)
                .invoke_async(&mut manager)
                .await
                .map_err(|source| QueueError::Script {
                    name: "add_job",
                    source,
                })?;
        }

        debug!(job_id = %id, delay, "job added");
        Ok(id)
    }

    async fn claim_next(&self, timeout_ms: u64) -> Result<Option<ClaimedJob>, QueueError> {
        let timeout_secs = (timeout_ms as f64 / 1000.0).max(0.01);
        let mut blocking = self.blocking.lock().await;

        let popped: Option<String> = blocking
            .brpoplpush(self.keys.wait(), self.keys.active(), timeout_secs)
            .await?;
        drop(blocking);

        let Some(id) = popped else {
            return Ok(None);
        };

        let lock_token = Uuid::new_v4().to_string();
        let mut manager = self.manager.clone();
        let result: Option<(String, String, String, String)> = Self::claim_next_script()
            .key(self.keys.job(&id))
            .key(self.keys.lock(&id))
            .arg(&lock_token)
            .arg(self.lock_duration_ms)
            .arg(&id)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut manager)
            .await
            .map_err(|source| QueueError::Script {
                name: "claim_next",
                source,
            })?;

        let Some((data_json, opts_json, attempts, timestamp)) = result else {
            // The wait -> active move raced a concurrent removal; the job
            // payload is already gone. Nothing to hand the dispatcher.
            return Ok(None);
        };

        let data: Value = serde_json::from_str(&data_json)?;
        let opts: JobOpts = serde_json::from_str(&opts_json)?;

        Ok(Some(ClaimedJob {
            job: ClaimedJobData {
                id,
                data,
                opts,
                attempts_made: attempts.parse().unwrap_or(0),
                timestamp: timestamp.parse().unwrap_or(0),
            },
            lock_token,
        }))
    }

    async fn renew_lock(
        &self,
        job_id: &str,
        lock_token: &str,
        ttl_ms: u64,
    ) -> Result<(), QueueError> {
        let mut manager = self.manager.clone();
        let renewed: i64 = Self::renew_lock_script()
            .key(self.keys.lock(job_id))
            .arg(lock_token)
            .arg(ttl_ms)
            .invoke_async(&mut manager)
            .await
            .map_err(|source| QueueError::Script {
                name: "renew_lock",
                source,
            })?;

        if renewed == 0 {
            return Err(QueueError::LockLost {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_progress(&self, job_id: &str, progress: Value) -> Result<(), QueueError> {
        let mut manager = self.manager.clone();
        let encoded = serde_json::to_string(&progress)?;
        let _: () = manager.hset(self.keys.job(job_id), "progress", encoded).await?;
        let _: Result<i64, _> = manager
            .publish(self.keys.event_channel("progress"), job_id)
            .await;
        Ok(())
    }

    async fn move_to_completed(
        &self,
        job_id: &str,
        lock_token: &str,
        return_value: Value,
    ) -> Result<(), QueueError> {
        let mut manager = self.manager.clone();
        let encoded = serde_json::to_string(&return_value)?;
        let now = Utc::now().timestamp_millis();

        let ok: i64 = Self::move_to_completed_script()
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.active())
            .key(self.keys.completed())
            .arg(lock_token)
            .arg(job_id)
            .arg(encoded)
            .arg(now)
            .invoke_async(&mut manager)
            .await
            .map_err(|source| QueueError::Script {
                name: "move_to_completed",
                source,
            })?;

        if ok == 0 {
            return Err(QueueError::LockLost {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn move_to_failed(
        &self,
        job_id: &str,
        lock_token: &str,
        _kind: FailureKind,
        reason: String,
        stacktrace: Vec<String>,
    ) -> Result<(), QueueError> {
        let mut manager = self.manager.clone();
        let now = Utc::now().timestamp_millis();
        let stacktrace_json = serde_json::to_string(&stacktrace)?;

        let opts_json: Option<String> = manager.hget(self.keys.job(job_id), "opts").await?;
        let opts: JobOpts = match opts_json {
            Some(raw) => serde_json::from_str(&raw)?,
            None => JobOpts::default(),
        };

        let (outcome, attempts): (String, i64) = Self::move_to_failed_script()
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.active())
            .key(self.keys.failed())
            .key(self.keys.wait())
            .key(self.keys.delayed())
            .arg(lock_token)
            .arg(job_id)
            .arg(&reason)
            .arg(&stacktrace_json)
            .arg(now)
            .arg(opts.attempts)
            .invoke_async(&mut manager)
            .await
            .map_err(|source| QueueError::Script {
                name: "move_to_failed",
                source,
            })?;

        if outcome == "lockmismatch" {
            return Err(QueueError::LockLost {
                job_id: job_id.to_string(),
            });
        }

        if outcome == "retry" {
            let delay_ms = opts
                .backoff
                .map(|b| b.delay_for_attempt(attempts as u32))
                .unwrap_or(0);
            if delay_ms > 0 {
                let due_at = now + delay_ms;
                let _: () = manager.zadd(self.keys.delayed(), job_id, due_at).await?;
                let _: Result<i64, _> = manager.publish(self.keys.channel_delayed(), due_at).await;
            } else {
                let _: () = manager.lpush(self.keys.wait(), job_id).await?;
            }
        }

        Ok(())
    }

    async fn promote_delayed(&self) -> Result<Option<i64>, QueueError> {
        let mut manager = self.manager.clone();
        let now = Utc::now().timestamp_millis();
        UpdateDelaySet::invoke(&mut manager, &self.keys, now)
            .await
            .map_err(|source| QueueError::Script {
                name: "update_delay_set",
                source,
            })
    }

    async fn reap_stalled(&self, max_stalled_count: u32) -> Result<StalledReport, QueueError> {
        let mut manager = self.manager.clone();
        let now = Utc::now().timestamp_millis();
        let (failed, recovered) =
            MoveUnlockedJobsToWait::invoke(&mut manager, &self.keys, max_stalled_count, now)
                .await
                .map_err(|source| QueueError::Script {
                    name: "move_unlocked_jobs_to_wait",
                    source,
                })?;

        if !failed.is_empty() {
            warn!(count = failed.len(), "jobs exceeded stalled-retry limit, moved to failed");
        }
        Ok(StalledReport { recovered, failed })
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut manager = self.manager.clone();
        PauseResumeGlobal::invoke(&mut manager, &self.keys, true)
            .await
            .map_err(|source| QueueError::Script {
                name: "pause_resume_global",
                source,
            })?;
        let _: Result<i64, _> = manager.publish(self.keys.channel_paused(), "paused").await;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut manager = self.manager.clone();
        PauseResumeGlobal::invoke(&mut manager, &self.keys, false)
            .await
            .map_err(|source| QueueError::Script {
                name: "pause_resume_global",
                source,
            })?;
        let _: Result<i64, _> = manager.publish(self.keys.channel_paused(), "resumed").await;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut manager = self.manager.clone();
        let exists: bool = manager.exists(self.keys.meta_paused()).await?;
        Ok(exists)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        let mut manager = self.manager.clone();
        let fields: HashMap<String, String> = manager.hgetall(self.keys.job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let data = fields
            .get("data")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or(Value::Null);
        let opts: JobOpts = fields
            .get("opts")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default();
        let progress = fields
            .get("progress")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or(Value::Null);
        let return_value = fields
            .get("returnValue")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?;
        let stacktrace = fields
            .get("stacktrace")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Some(JobRecord {
            id: job_id.to_string(),
            data,
            opts,
            progress,
            attempts_made: fields
                .get("attemptsMade")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            failed_reason: fields.get("failedReason").cloned(),
            stacktrace,
            return_value,
            timestamp: fields
                .get("timestamp")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            processed_on: fields.get("processedOn").and_then(|raw| raw.parse().ok()),
            finished_on: fields.get("finishedOn").and_then(|raw| raw.parse().ok()),
        }))
    }

    async fn counts(&self) -> Result<JobCountsRaw, QueueError> {
        let mut manager = self.manager.clone();
        let wait: u64 = manager.llen(self.keys.wait()).await?;
        let active: u64 = manager.llen(self.keys.active()).await?;
        let delayed: u64 = manager.zcard(self.keys.delayed()).await?;
        let completed: u64 = manager.zcard(self.keys.completed()).await?;
        let failed: u64 = manager.zcard(self.keys.failed()).await?;
        let paused: u64 = manager.llen(self.keys.paused()).await?;

        Ok(JobCountsRaw {
            wait,
            active,
            delayed,
            completed,
            failed,
            paused,
        })
    }

    async fn list_ids(&self, collection: JobListCollection) -> Result<Vec<String>, QueueError> {
        let mut manager = self.manager.clone();
        let ids = match collection {
            JobListCollection::Waiting => {
                let mut ids: Vec<String> = manager.lrange(self.keys.wait(), 0, -1).await?;
                let paused: Vec<String> = manager.lrange(self.keys.paused(), 0, -1).await?;
                ids.extend(paused);
                ids
            }
            JobListCollection::Active => manager.lrange(self.keys.active(), 0, -1).await?,
            JobListCollection::Delayed => manager.zrange(self.keys.delayed(), 0, -1).await?,
            JobListCollection::Completed => manager.zrange(self.keys.completed(), 0, -1).await?,
            JobListCollection::Failed => manager.zrange(self.keys.failed(), 0, -1).await?,
        };
        Ok(ids)
    }

    async fn clean(
        &self,
        collection: CleanCollection,
        grace_ms: i64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, QueueError> {
        let mut manager = self.manager.clone();
        let set_key = match collection {
            CleanCollection::Completed => self.keys.completed(),
            CleanCollection::Failed => self.keys.failed(),
        };
        let cutoff = Utc::now().timestamp_millis() - grace_ms;
        CleanJobsInSet::invoke(
            &mut manager,
            &set_key,
            &self.keys.job_key_prefix(),
            cutoff,
            limit.unwrap_or(0),
        )
        .await
            .map_err(|source| QueueError::Script {
                name: "clean_jobs_in_set",
                source,
            })
    }

    async fn empty(&self) -> Result<(), QueueError> {
        let mut manager = self.manager.clone();
        let _: () = manager
            .del((
                self.keys.wait(),
                self.keys.paused(),
                self.keys.delayed(),
                self.keys.priority(),
                self.keys.meta_paused(),
            ))
            .await?;
        Ok(())
    }

    fn delay_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.delay_notify)
    }

    fn pause_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.pause_notify)
    }
}
