//! In-process event bus feeding the SSE stream.
//!
//! Delivery goes to currently connected subscribers only. There is no replay
//! buffer; a subscriber that falls more than `capacity` events behind skips
//! the missed ones.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use hive_core::unix_timestamp;

/// Every state change the hub announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    #[serde(rename = "agent.stopped")]
    AgentStopped,
    #[serde(rename = "agent.destroyed")]
    AgentDestroyed,
    #[serde(rename = "agent.status")]
    AgentStatus,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    #[serde(rename = "solicitation.created")]
    SolicitationCreated,
    #[serde(rename = "solicitation.responded")]
    SolicitationResponded,
    #[serde(rename = "solicitation.dismissed")]
    SolicitationDismissed,
    #[serde(rename = "solicitation.expired")]
    SolicitationExpired,
    #[serde(rename = "port.acquired")]
    PortAcquired,
    #[serde(rename = "port.released")]
    PortReleased,
    #[serde(rename = "port.waiting")]
    PortWaiting,
    #[serde(rename = "port.timeout")]
    PortTimeout,
}

impl EventKind {
    /// Wire name, also used as the SSE `event:` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgentSpawned => "agent.spawned",
            Self::AgentStopped => "agent.stopped",
            Self::AgentDestroyed => "agent.destroyed",
            Self::AgentStatus => "agent.status",
            Self::MessageSent => "message.sent",
            Self::TaskCreated => "task.created",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskCancelled => "task.cancelled",
            Self::SolicitationCreated => "solicitation.created",
            Self::SolicitationResponded => "solicitation.responded",
            Self::SolicitationDismissed => "solicitation.dismissed",
            Self::SolicitationExpired => "solicitation.expired",
            Self::PortAcquired => "port.acquired",
            Self::PortReleased => "port.released",
            Self::PortWaiting => "port.waiting",
            Self::PortTimeout => "port.timeout",
        }
    }
}

/// A single broadcast state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

/// Cloneable publish/subscribe handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    #[cfg(feature = "metrics")]
    metrics: hive_core::metrics::HubMetrics,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            #[cfg(feature = "metrics")]
            metrics: hive_core::metrics::HubMetrics::new(),
        }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, kind: EventKind, payload: impl Serialize) {
        let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        let event = Event {
            kind,
            payload,
            timestamp: unix_timestamp(),
        };
        #[cfg(feature = "metrics")]
        self.metrics.events_published.add(1, &[]);
        let delivered = self.tx.send(event).unwrap_or(0);
        debug!(event = kind.as_str(), delivered, "Published event");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
