//! # Notifier — real-time simulation events
//!
//! ## Responsibility
//! Fan every queue and run transition out to all connected clients over a
//! single `tokio::sync::broadcast` channel.
//!
//! ## Guarantees
//! - Non-blocking: publishing never waits on a slow subscriber
//! - Lossy for laggards: a subscriber that falls more than the channel
//!   capacity behind skips the missed events and keeps receiving
//! - Publishing with zero subscribers is not an error
//!
//! ## NOT Responsible For
//! - Per-client filtering (every client receives every event)
//! - WebSocket framing (see: `web_api`)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Default broadcast buffer size.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Kind of a [`SimulationEvent`], serialized as the event's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A queue and its runs were created.
    QueueCreated,
    /// A queue began dispatching.
    QueueStarted,
    /// A queue stopped dispatching new runs.
    QueuePaused,
    /// A paused queue resumed dispatching.
    QueueResumed,
    /// A queue was halted by the user.
    QueueStopped,
    /// Every run of a queue reached a terminal status.
    QueueCompleted,
    /// Aggregates of a queue changed.
    QueueProgress,
    /// A run was dispatched to the executor.
    SimulationStarted,
    /// The runner reported a negotiation round.
    SimulationRound,
    /// A run completed with an outcome.
    SimulationCompleted,
    /// A run failed.
    SimulationFailed,
    /// A run exceeded its timeout.
    SimulationTimeout,
    /// A terminal run was reset to pending.
    SimulationRestarted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QueueCreated => "queue_created",
            Self::QueueStarted => "queue_started",
            Self::QueuePaused => "queue_paused",
            Self::QueueResumed => "queue_resumed",
            Self::QueueStopped => "queue_stopped",
            Self::QueueCompleted => "queue_completed",
            Self::QueueProgress => "queue_progress",
            Self::SimulationStarted => "simulation_started",
            Self::SimulationRound => "simulation_round",
            Self::SimulationCompleted => "simulation_completed",
            Self::SimulationFailed => "simulation_failed",
            Self::SimulationTimeout => "simulation_timeout",
            Self::SimulationRestarted => "simulation_restarted",
        };
        f.write_str(s)
    }
}

/// Event pushed to WebSocket clients as `{type, negotiationId, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Negotiation the event belongs to.
    pub negotiation_id: String,
    /// Event payload (queue progress, run record, round update, ...).
    pub data: Value,
}

impl SimulationEvent {
    /// Build an event, serializing `data` into JSON.
    ///
    /// A payload that fails to serialize is sent as `null`.
    pub fn new(kind: EventKind, negotiation_id: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            kind,
            negotiation_id: negotiation_id.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    /// Wire form sent to clients.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Shared broadcast hub. Cloning shares the same channel.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SimulationEvent>,
}

impl Notifier {
    /// Create a hub buffering up to `capacity` events per subscriber.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: SimulationEvent) {
        let kind = event.kind;
        match self.tx.send(event) {
            Ok(receivers) => debug!(event = %kind, receivers, "event published"),
            Err(_) => debug!(event = %kind, "event dropped, no subscribers"),
        }
    }

    /// Shorthand for [`Notifier::publish`] with [`SimulationEvent::new`].
    pub fn emit(&self, kind: EventKind, negotiation_id: &str, data: impl Serialize) {
        self.publish(SimulationEvent::new(kind, negotiation_id, data));
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SimulationEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
