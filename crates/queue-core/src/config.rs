//! Configuration frozen at construction time — never read from
//! process-wide mutable state once a [`crate::Queue`] is built.

use serde::{Deserialize, Serialize};

use crate::keys::DEFAULT_PREFIX;

/// `2^31 - 1`, the ceiling `setTimeout`-style delays are clamped against.
pub const MAX_TIMEOUT_MS: i64 = 2_147_483_647;

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

const fn default_lock_duration_ms() -> u64 {
    5_000
}

const fn default_lock_renew_time_ms() -> u64 {
    2_500
}

const fn default_stalled_check_interval_ms() -> u64 {
    5_000
}

const fn default_max_stalled_count() -> u32 {
    1
}

const fn default_client_close_timeout_ms() -> u64 {
    5_000
}

const fn default_polling_interval_ms() -> u64 {
    5_000
}

/// Either a single connection URL or discrete fields. `db` is the single
/// canonical name for the selected database index — the distilled spec's
/// inconsistent `DB` key is resolved in favor of this one spelling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Connection {
    Url { redis_url: String },
    Discrete {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default)]
        db: i64,
        #[serde(default)]
        password: Option<String>,
    },
}

const fn default_port() -> u16 {
    6379
}

impl Connection {
    pub fn to_redis_url(&self) -> String {
        match self {
            Connection::Url { redis_url } => redis_url.clone(),
            Connection::Discrete {
                host,
                port,
                db,
                password,
            } => match password {
                Some(pw) => format!("redis://:{pw}@{host}:{port}/{db}"),
                None => format!("redis://{host}:{port}/{db}"),
            },
        }
    }
}

/// Optional multi-instance locking config, carried for interface
/// compatibility. See DESIGN.md for why this expansion does not implement
/// Redlock's distributed-majority algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedlockConfig {
    #[serde(default = "default_drift_factor")]
    pub drift_factor: f64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

const fn default_drift_factor() -> f64 {
    0.01
}

const fn default_retry_count() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    200
}

/// Connection and tuning options for one [`crate::Queue`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(flatten)]
    pub connection: Connection,

    #[serde(default = "default_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub redlock: Option<RedlockConfig>,

    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    #[serde(default = "default_lock_renew_time_ms")]
    pub lock_renew_time_ms: u64,

    /// Set to 0 to disable the stalled-job reaper entirely.
    #[serde(default = "default_stalled_check_interval_ms")]
    pub stalled_check_interval_ms: u64,

    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    #[serde(default = "default_client_close_timeout_ms")]
    pub client_close_timeout_ms: u64,

    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
}

impl QueueConfig {
    /// Convenience constructor for the common case of a single connection
    /// URL with every tuning value left at the spec's defaults.
    pub fn from_url(redis_url: impl Into<String>) -> Self {
        Self {
            connection: Connection::Url {
                redis_url: redis_url.into(),
            },
            key_prefix: default_prefix(),
            redlock: None,
            lock_duration_ms: default_lock_duration_ms(),
            lock_renew_time_ms: default_lock_renew_time_ms(),
            stalled_check_interval_ms: default_stalled_check_interval_ms(),
            max_stalled_count: default_max_stalled_count(),
            client_close_timeout_ms: default_client_close_timeout_ms(),
            polling_interval_ms: default_polling_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_connection_builds_a_redis_url() {
        let conn = Connection::Discrete {
            host: "localhost".into(),
            port: 6379,
            db: 2,
            password: None,
        };
        assert_eq!(conn.to_redis_url(), "redis://localhost:6379/2");
    }

    #[test]
    fn from_url_fills_in_spec_defaults() {
        let cfg = QueueConfig::from_url("redis://localhost/0");
        assert_eq!(cfg.key_prefix, "bull");
        assert_eq!(cfg.lock_duration_ms, 5_000);
        assert_eq!(cfg.max_stalled_count, 1);
    }

    #[test]
    fn deserializes_from_json_with_defaults() {
        let cfg: QueueConfig = serde_json::from_str(r#"{"redis_url":"redis://localhost/0"}"#)
            .expect("valid config");
        assert_eq!(cfg.stalled_check_interval_ms, 5_000);
    }
}
