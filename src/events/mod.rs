//! Typed events: an in-process bus for component handlers and an append-only
//! store feeding SSE/WebSocket subscribers.

pub mod bus;
pub mod store;

pub use bus::{BusMetrics, EventBus, HandlerResult};
pub use store::EventStore;

use crate::time::epoch_secs;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known event types emitted by the merger.
pub mod types {
    pub const RUN_STARTED: &str = "run_started";
    pub const RUN_DONE: &str = "run_done";
    pub const FETCH_PROGRESS: &str = "fetch_progress";
    pub const BATCH_COMPLETE: &str = "batch_complete";
    pub const SOURCE_VALIDATED: &str = "source_validated";
    pub const SOURCE_QUARANTINED: &str = "source_quarantined";
    pub const READY_PROBE: &str = "ready_probe";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Epoch seconds; doubles as the SSE event id for Last-Event-ID replay.
    pub ts: f64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            ts: epoch_secs(),
            source: source.into(),
            data,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The run this event belongs to, when the payload carries one.
    pub fn run_id(&self) -> Option<&str> {
        self.data.get("run_id").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_key() {
        let event = Event::new(types::RUN_STARTED, serde_json::json!({"total": 3}), "merger");
        let json = serde_json::to_value(&event).expect("serializes");
        assert_eq!(json["type"], "run_started");
        assert_eq!(json["data"]["total"], 3);
        assert!(json["ts"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn run_id_extraction() {
        let event = Event::new(
            types::FETCH_PROGRESS,
            serde_json::json!({"run_id": "r-1", "done": 2}),
            "merger",
        );
        assert_eq!(event.run_id(), Some("r-1"));
        let bare = Event::new(types::RUN_DONE, serde_json::json!({}), "merger");
        assert_eq!(bare.run_id(), None);
    }
}
