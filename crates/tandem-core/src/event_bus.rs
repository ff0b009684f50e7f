use serde_json::Value;
use tokio::sync::broadcast;

use tandem_types::EngineEvent;

const DEFAULT_CAPACITY: usize = 2048;

/// Process-wide fan-out of engine events. Slow subscribers lag and drop
/// events rather than block publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event_type = %event.event_type, "publish");
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, event_type: impl Into<String>, properties: Value) {
        self.publish(EngineEvent::new(event_type, properties));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::with_capacity(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.emit("routine.fired", json!({"routineID": "r-1"}));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "routine.fired");
        assert_eq!(event.property_str("routineID"), Some("r-1"));
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit("mission.created", json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
