//! Progress event broadcaster
//!
//! Every cycle transition, conflict outcome and pool change is published on a
//! broadcast channel. Subscribers (the CLI, tests, an outer front end) see
//! timestamped events with a human-readable summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// Event name constants
pub const EVENT_CYCLE_ADMITTED: &str = "cycle:admitted";
pub const EVENT_CYCLE_PHASE_CHANGED: &str = "cycle:phase_changed";
pub const EVENT_CYCLE_BLOCKED: &str = "cycle:blocked";
pub const EVENT_CYCLE_RESUMED: &str = "cycle:resumed";
pub const EVENT_CYCLE_COMPLETED: &str = "cycle:completed";
pub const EVENT_CYCLE_FAILED: &str = "cycle:failed";
pub const EVENT_CONFLICT_DETECTED: &str = "conflict:detected";
pub const EVENT_CONFLICT_RESOLVED: &str = "conflict:resolved";
pub const EVENT_CONFLICT_ESCALATED: &str = "conflict:escalated";
pub const EVENT_STORAGE_DEGRADED: &str = "storage:degraded";
pub const EVENT_POOL_SCALED: &str = "pool:scaled";

/// A progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Event type (e.g., "cycle:completed")
    pub event: String,
    pub cycle_id: Option<String>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    /// Event payload as JSON value
    pub payload: serde_json::Value,
}

/// Payload for phase transition events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChangedPayload {
    pub story_id: String,
    pub old_phase: String,
    pub new_phase: String,
}

/// Payload for pool scaling events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolScaledPayload {
    pub role: String,
    pub old_size: usize,
    pub new_size: usize,
}

/// Broadcasts events to all subscribers
pub struct EventBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster with a channel capacity of 1000 events
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    /// Broadcast an event
    pub fn broadcast(
        &self,
        event_type: &str,
        cycle_id: Option<&str>,
        summary: impl Into<String>,
        payload: impl Serialize,
    ) {
        let event = ProgressEvent {
            event: event_type.to_string(),
            cycle_id: cycle_id.map(String::from),
            summary: summary.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        };
        log::debug!("[Events] {} {}", event.event, event.summary);

        // Ignore send errors (no receivers)
        let _ = self.tx.send(event);
    }

    /// Subscribe to events (returns a receiver)
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_broadcaster() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(
            EVENT_CYCLE_PHASE_CHANGED,
            Some("cyc-1"),
            "cyc-1 DESIGN -> TEST_RED",
            PhaseChangedPayload {
                story_id: "S-1".to_string(),
                old_phase: "DESIGN".to_string(),
                new_phase: "TEST_RED".to_string(),
            },
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, "cycle:phase_changed");
        assert_eq!(event.cycle_id.as_deref(), Some("cyc-1"));
        assert_eq!(event.payload["newPhase"], "TEST_RED");
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let broadcaster = EventBroadcaster::new();
        // Should not panic when there are no receivers
        broadcaster.broadcast(EVENT_STORAGE_DEGRADED, None, "disk full", ());
    }
}
