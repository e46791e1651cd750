//! Typed lifecycle events published by pools, adapters, streams and the engine.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::execution::{ExecutionMetrics, ExecutionStatus};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum Event {
    #[serde(rename = "execution.started")]
    ExecutionStarted { context_id: Uuid, mapping_id: String },
    #[serde(rename = "execution.progress")]
    ExecutionProgress {
        context_id: Uuid,
        current: u64,
        total: Option<u64>,
        percent: f64,
    },
    #[serde(rename = "execution.error")]
    ExecutionError {
        context_id: Uuid,
        record: Option<serde_json::Value>,
        kind: ErrorKind,
        error: String,
    },
    #[serde(rename = "execution.completed")]
    ExecutionCompleted {
        context_id: Uuid,
        metrics: ExecutionMetrics,
    },
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled {
        context_id: Uuid,
        reason: Option<String>,
    },
    #[serde(rename = "execution.state")]
    ExecutionStateChanged {
        context_id: Uuid,
        previous: ExecutionStatus,
        new: ExecutionStatus,
        payload: Option<serde_json::Value>,
    },
    #[serde(rename = "pool.connect")]
    PoolConnect { pool: String, connection_id: u64 },
    #[serde(rename = "pool.disconnect")]
    PoolDisconnect { pool: String, connection_id: u64 },
    #[serde(rename = "pool.acquire")]
    PoolAcquire {
        pool: String,
        connection_id: u64,
        waited_ms: u64,
    },
    #[serde(rename = "pool.release")]
    PoolRelease { pool: String, connection_id: u64 },
    #[serde(rename = "pool.error")]
    PoolError { pool: String, error: String },
    #[serde(rename = "stream.backpressure")]
    StreamBackpressure { stream_id: String, buffer: usize },
    #[serde(rename = "adapter.connected")]
    AdapterConnected {
        system_id: String,
        server_version: Option<String>,
    },
    #[serde(rename = "adapter.disconnected")]
    AdapterDisconnected { system_id: String },
}

impl Event {
    /// Dotted event name, e.g. `pool.acquire`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ExecutionStarted { .. } => "execution.started",
            Event::ExecutionProgress { .. } => "execution.progress",
            Event::ExecutionError { .. } => "execution.error",
            Event::ExecutionCompleted { .. } => "execution.completed",
            Event::ExecutionCancelled { .. } => "execution.cancelled",
            Event::ExecutionStateChanged { .. } => "execution.state",
            Event::PoolConnect { .. } => "pool.connect",
            Event::PoolDisconnect { .. } => "pool.disconnect",
            Event::PoolAcquire { .. } => "pool.acquire",
            Event::PoolRelease { .. } => "pool.release",
            Event::PoolError { .. } => "pool.error",
            Event::StreamBackpressure { .. } => "stream.backpressure",
            Event::AdapterConnected { .. } => "adapter.connected",
            Event::AdapterDisconnected { .. } => "adapter.disconnected",
        }
    }

    /// The run an execution event belongs to.
    pub fn context_id(&self) -> Option<Uuid> {
        match self {
            Event::ExecutionStarted { context_id, .. }
            | Event::ExecutionProgress { context_id, .. }
            | Event::ExecutionError { context_id, .. }
            | Event::ExecutionCompleted { context_id, .. }
            | Event::ExecutionCancelled { context_id, .. }
            | Event::ExecutionStateChanged { context_id, .. } => Some(*context_id),
            _ => None,
        }
    }
}

/// Fan-out channel for [`Event`]s.
///
/// Publishing never blocks. Slow subscribers lose the oldest events rather than slowing the
/// publisher down.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new bus keeping up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes `event` to every current subscriber. Events without subscribers are dropped.
    pub fn publish(&self, event: Event) {
        // Sending only fails when nobody listens, which is fine.
        let _ = self.tx.send(event);
    }

    /// Creates a new subscriber receiving every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::default();
        bus.publish(Event::PoolError {
            pool: "p".into(),
            error: "boom".into(),
        });

        let mut rx = bus.subscribe();
        bus.publish(Event::StreamBackpressure {
            stream_id: "s".into(),
            buffer: 10,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "stream.backpressure");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "stream.backpressure", "streamId": "s", "buffer": 10})
        );
    }
}
