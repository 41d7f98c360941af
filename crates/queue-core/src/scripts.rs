//! The four collection-level atomic scripts core owns directly.
//!
//! Per-job transitions (claim, complete, fail, retry) belong to the
//! [`crate::job::JobStore`] seam because they're the backend's business;
//! these four operate purely on the shared collection keys (`wait`,
//! `active`, `delayed`, `paused`, `priority`) that every component here
//! addresses through a [`crate::KeyNamer`], so they live in core instead.
//!
//! Each is wrapped in a named unit struct rather than a bare
//! `redis::Script`, so call sites read as `UpdateDelaySet::load().invoke(..)`
//! instead of an anonymous script value threaded through function
//! signatures.

use redis::aio::ConnectionLike;
use redis::{RedisResult, Script};

use crate::keys::KeyNamer;

/// Promotes every delayed entry whose score has elapsed into `wait` (or
/// `priority` when the job carries one), then reports when the delay
/// controller next needs to wake.
///
/// `KEYS[1]` = delayed zset, `KEYS[2]` = wait list, `KEYS[3]` = priority
/// zset, `KEYS[4]` = job key prefix. `ARGV[1]` = current time in ms.
/// Returns the lowest score still present in `delayed` after the move, or
/// nil if it's now empty.
pub struct UpdateDelaySet;

impl UpdateDelaySet {
    const SOURCE: &'static str = r#"
        local delayed = KEYS[1]
        local wait = KEYS[2]
        local priority = KEYS[3]
        local job_key_prefix = KEYS[4]
        local now = ARGV[1]

        local ready = redis.call('ZRANGEBYSCORE', delayed, '-inf', now)
        for _, id in ipairs(ready) do
            redis.call('ZREM', delayed, id)
            local prio = redis.call('HGET', job_key_prefix .. id, 'priority')
            if prio and tonumber(prio) > 0 then
                redis.call('ZADD', priority, prio, id)
            else
                redis.call('LPUSH', wait, id)
            end
        end

        local entry = redis.call('ZRANGE', delayed, 0, 0, 'WITHSCORES')
        if #entry == 0 then
            return false
        end
        return tonumber(entry[2])
    "#;

    pub fn load() -> Script {
        Script::new(Self::SOURCE)
    }

    pub async fn invoke<C>(conn: &mut C, keys: &KeyNamer, now_ms: i64) -> RedisResult<Option<i64>>
    where
        C: ConnectionLike + Send,
    {
        Self::load()
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.priority())
            .key(keys.job_key_prefix())
            .arg(now_ms)
            .invoke_async(conn)
            .await
    }
}

/// Atomically reclaims every `active` job whose lock has expired: one
/// `EVAL`, so two reaper sweeps racing from two different worker
/// processes can never both observe the missing lock and both push the
/// same id back onto `wait` — that double-claim is exactly what the lock
/// protocol exists to prevent.
///
/// `KEYS[1]` = active list, `KEYS[2]` = job key prefix, `KEYS[3]` = wait
/// list, `KEYS[4]` = failed zset. `ARGV[1]` = max stalled retries,
/// `ARGV[2]` = current time in ms. Returns `{failed_ids, stalled_ids}`.
pub struct MoveUnlockedJobsToWait;

impl MoveUnlockedJobsToWait {
    const SOURCE: &'static str = r#"
        local active = KEYS[1]
        local job_key_prefix = KEYS[2]
        local wait = KEYS[3]
        local failed = KEYS[4]
        local max_stalled = tonumber(ARGV[1])
        local now = ARGV[2]

        local ids = redis.call('LRANGE', active, 0, -1)
        local failed_ids = {}
        local stalled_ids = {}

        for _, id in ipairs(ids) do
            local lock_key = job_key_prefix .. id .. ':lock'
            if redis.call('EXISTS', lock_key) == 0 then
                redis.call('LREM', active, 0, id)
                local stall_count = tonumber(redis.call('HINCRBY', job_key_prefix .. id, 'stalledCount', 1))
                if stall_count > max_stalled then
                    redis.call('HSET', job_key_prefix .. id,
                        'failedReason', 'job stalled more than allowable limit',
                        'finishedOn', now)
                    redis.call('ZADD', failed, now, id)
                    table.insert(failed_ids, id)
                else
                    redis.call('LPUSH', wait, id)
                    table.insert(stalled_ids, id)
                end
            end
        end

        return {failed_ids, stalled_ids}
    "#;

    pub fn load() -> Script {
        Script::new(Self::SOURCE)
    }

    pub async fn invoke<C>(
        conn: &mut C,
        keys: &KeyNamer,
        max_stalled_count: u32,
        now_ms: i64,
    ) -> RedisResult<(Vec<String>, Vec<String>)>
    where
        C: ConnectionLike + Send,
    {
        Self::load()
            .key(keys.active())
            .key(keys.job_key_prefix())
            .key(keys.wait())
            .key(keys.failed())
            .arg(max_stalled_count)
            .arg(now_ms)
            .invoke_async(conn)
            .await
    }
}

/// Removes finished job ids older than a grace period from `completed` or
/// `failed`.
///
/// `KEYS[1]` = the target zset. `ARGV[1]` = cutoff timestamp (ids with
/// score below this are stale), `ARGV[2]` = limit (0 means unbounded).
/// Returns the ids removed.
pub struct CleanJobsInSet;

impl CleanJobsInSet {
    const SOURCE: &'static str = r#"
        local set = KEYS[1]
        local job_key_prefix = KEYS[2]
        local cutoff = ARGV[1]
        local limit = tonumber(ARGV[2])

        local candidates
        if limit > 0 then
            candidates = redis.call('ZRANGEBYSCORE', set, '-inf', cutoff, 'LIMIT', 0, limit)
        else
            candidates = redis.call('ZRANGEBYSCORE', set, '-inf', cutoff)
        end

        for _, id in ipairs(candidates) do
            redis.call('ZREM', set, id)
            redis.call('DEL', job_key_prefix .. id)
            redis.call('DEL', job_key_prefix .. id .. ':lock')
        end
        return candidates
    "#;

    pub fn load() -> Script {
        Script::new(Self::SOURCE)
    }

    pub async fn invoke<C>(
        conn: &mut C,
        set_key: &str,
        job_key_prefix: &str,
        cutoff_ms: i64,
        limit: usize,
    ) -> RedisResult<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        Self::load()
            .key(set_key)
            .key(job_key_prefix)
            .arg(cutoff_ms)
            .arg(limit as i64)
            .invoke_async(conn)
            .await
    }
}

/// Flips the `meta-paused` marker and, when pausing, drains `wait` into
/// `paused` (or refills `wait` from `paused` on resume) so in-flight
/// producers never race the transition.
///
/// `KEYS[1]` = meta-paused marker, `KEYS[2]` = wait, `KEYS[3]` = paused.
/// `ARGV[1]` = "pause" or "resume".
pub struct PauseResumeGlobal;

impl PauseResumeGlobal {
    const SOURCE: &'static str = r#"
        local marker = KEYS[1]
        local wait = KEYS[2]
        local paused = KEYS[3]
        local action = ARGV[1]

        if action == 'pause' then
            redis.call('SET', marker, '1')
            while true do
                local id = redis.call('RPOPLPUSH', wait, paused)
                if not id then break end
            end
        else
            redis.call('DEL', marker)
            while true do
                local id = redis.call('RPOPLPUSH', paused, wait)
                if not id then break end
            end
        end
        return redis.status_reply('OK')
    "#;

    pub fn load() -> Script {
        Script::new(Self::SOURCE)
    }

    pub async fn invoke<C>(conn: &mut C, keys: &KeyNamer, pause: bool) -> RedisResult<()>
    where
        C: ConnectionLike + Send,
    {
        let action = if pause { "pause" } else { "resume" };
        Self::load()
            .key(keys.meta_paused())
            .key(keys.wait())
            .key(keys.paused())
            .arg(action)
            .invoke_async(conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_compile_to_nonempty_source() {
        assert!(!UpdateDelaySet::SOURCE.trim().is_empty());
        assert!(!MoveUnlockedJobsToWait::SOURCE.trim().is_empty());
        assert!(!CleanJobsInSet::SOURCE.trim().is_empty());
        assert!(!PauseResumeGlobal::SOURCE.trim().is_empty());
    }
}
