//! The local event bus. Every state transition the engine makes is
//! broadcast here; a pub/sub-relayed copy of the same transition arriving
//! from another process is tagged [`Origin::Remote`] so listeners can tell
//! the two apart without inspecting payload contents.

use serde_json::Value;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Ready,
    Error,
    Waiting,
    Active,
    Stalled,
    Progress,
    Completed,
    Failed,
    Removed,
    Cleaned,
    Paused,
    Resumed,
    NoJobRetrieved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Error => "error",
            EventKind::Waiting => "waiting",
            EventKind::Active => "active",
            EventKind::Stalled => "stalled",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Removed => "removed",
            EventKind::Cleaned => "cleaned",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::NoJobRetrieved => "no-job-retrieved",
        }
    }
}

/// One occurrence on the bus. Carries the job id and a scalar/JSON payload
/// rather than a full [`crate::Job`] snapshot — a `Job` holds a store
/// handle that doesn't serialize, and most listeners only need the id plus
/// the small amount of data named here.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub job_id: String,
    pub origin: Origin,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, job_id: impl Into<String>, origin: Origin) -> Self {
        Self {
            kind,
            job_id: job_id.into(),
            origin,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Thin wrapper over a [`broadcast::Sender`]. Cloning shares the same
/// channel; every clone can publish and every subscriber sees every
/// publish regardless of which clone it came from.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes an event. Returns the number of active subscribers;
    /// publishing with zero subscribers is not an error, it's the common
    /// case when no one is listening for events.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::Completed, "42", Origin::Local));
        let received = rx.recv().await.expect("event delivered");
        assert_eq!(received.job_id, "42");
        assert_eq!(received.kind.as_str(), "completed");
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Event::new(EventKind::Waiting, "1", Origin::Local)), 0);
    }
}
