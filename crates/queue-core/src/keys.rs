//! Maps symbolic collection names to fully-qualified Redis keys.

/// Default key prefix used when none is configured, matching the
/// distilled spec's documented default.
pub const DEFAULT_PREFIX: &str = "bull";

/// Names Redis keys and pub/sub channels for one queue instance.
///
/// Every key is `<prefix>:<queue-name>:<subkey>`. Cheap to clone; hold one
/// per component that needs to address the store rather than threading a
/// `(prefix, queue)` pair through every call site.
#[derive(Debug, Clone)]
pub struct KeyNamer {
    prefix: String,
    queue: String,
}

impl KeyNamer {
    pub fn new(prefix: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            queue: queue.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn base(&self) -> String {
        format!("{}:{}:", self.prefix, self.queue)
    }

    pub fn wait(&self) -> String {
        format!("{}wait", self.base())
    }

    pub fn active(&self) -> String {
        format!("{}active", self.base())
    }

    pub fn delayed(&self) -> String {
        format!("{}delayed", self.base())
    }

    pub fn priority(&self) -> String {
        format!("{}priority", self.base())
    }

    pub fn completed(&self) -> String {
        format!("{}completed", self.base())
    }

    pub fn failed(&self) -> String {
        format!("{}failed", self.base())
    }

    pub fn paused(&self) -> String {
        format!("{}paused", self.base())
    }

    pub fn meta_paused(&self) -> String {
        format!("{}meta-paused", self.base())
    }

    pub fn id_counter(&self) -> String {
        format!("{}id", self.base())
    }

    /// Prefix shared by every per-job key (`<job>`, `<job>:lock`,
    /// `<job>:stalled`). Lua scripts that must address a job by id
    /// concatenate this with the id themselves.
    pub fn job_key_prefix(&self) -> String {
        self.base()
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}{}", self.base(), id)
    }

    pub fn lock(&self, id: &str) -> String {
        format!("{}{}:lock", self.base(), id)
    }

    pub fn channel_delayed(&self) -> String {
        format!("{}delayed", self.base())
    }

    pub fn channel_paused(&self) -> String {
        format!("{}paused", self.base())
    }

    /// Per-event distributed channel: `<event>@<queue-name>`.
    pub fn event_channel(&self, event: &str) -> String {
        format!("{}@{}", event, self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_prefix_and_queue() {
        let keys = KeyNamer::new("bull", "emails");
        assert_eq!(keys.wait(), "bull:emails:wait");
        assert_eq!(keys.active(), "bull:emails:active");
        assert_eq!(keys.lock("42"), "bull:emails:42:lock");
        assert_eq!(keys.job("42"), "bull:emails:42");
    }

    #[test]
    fn event_channel_is_event_at_queue() {
        let keys = KeyNamer::new("bull", "emails");
        assert_eq!(keys.event_channel("completed"), "completed@emails");
    }
}
