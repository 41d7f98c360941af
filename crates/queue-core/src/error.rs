use thiserror::Error;

/// Errors surfaced by the coordination engine.
///
/// Connection and script failures wrap the underlying [`redis::RedisError`];
/// everything else is a logical error the engine detected itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    #[error("redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("script `{name}` failed: {source}")]
    Script {
        name: &'static str,
        #[source]
        source: redis::RedisError,
    },

    #[error("failed to (de)serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock for job `{job_id}` was lost before the handler finished")]
    LockLost { job_id: String },

    #[error("no job found with id `{0}`")]
    NotFound(String),

    #[error("process() was called twice on the same queue")]
    HandlerAlreadyInstalled,

    #[error("unknown clean type `{0}`, expected \"completed\" or \"failed\"")]
    InvalidCleanType(String),

    #[error("store reports redis version `{found}`, need at least `{required}`")]
    VersionTooOld {
        found: String,
        required: &'static str,
    },

    #[error("queue is closing or closed")]
    Closed,
}
