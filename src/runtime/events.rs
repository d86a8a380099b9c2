//! Dispatcher notifications.
//!
//! Monitors and other observers subscribe to a broadcast channel of
//! [`DispatcherEvent`]s. Slow subscribers lag and miss events; the
//! dispatcher never waits on them.

use crate::function::FunctionStats;
use crate::worker::InvocationId;
use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered events per subscriber before it starts lagging.
pub const EVENT_CAPACITY: usize = 1024;

/// Aggregate runtime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Live worker processes in the current generation.
    pub workers: usize,
    /// Capacity available without spawning.
    pub available: usize,
    /// Invocations waiting for a worker.
    pub queued: usize,
    /// Invocations finished, successfully or not.
    pub completed: u64,
    /// Invocations that failed.
    pub errors: u64,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
    Crashed,
}

/// Event published by a dispatcher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatcherEvent {
    /// An invocation obtained a worker.
    Accepted { id: InvocationId, function: String },
    /// An invocation finished.
    Completed {
        id: InvocationId,
        function: String,
        outcome: Outcome,
        ms: Option<f64>,
    },
    /// Pool occupancy changed.
    Queue(RuntimeStats),
    /// A function's counters changed.
    Function { name: String, stats: FunctionStats },
    /// A new generation replaced the old one.
    Reloaded { functions: usize },
}

/// Sending half shared by a dispatcher's generations.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatcherEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: DispatcherEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DispatcherEvent::Reloaded { functions: 3 });
        match rx.recv().await.unwrap() {
            DispatcherEvent::Reloaded { functions } => assert_eq!(functions, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(DispatcherEvent::Queue(RuntimeStats::default()));
    }

    #[test]
    fn test_event_json_shape() {
        let event = DispatcherEvent::Completed {
            id: 4,
            function: "ok".to_string(),
            outcome: Outcome::TimedOut,
            ms: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "completed", "id": 4, "function": "ok", "outcome": "timed_out", "ms": null})
        );
    }
}
