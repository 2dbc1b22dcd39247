//! Federation events as an explicit tagged union plus append-only sinks.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FederationEvent {
    NodeRegistered { node_id: NodeId, trust_score: f64 },
    NodeRemoved { node_id: NodeId },
    RoundStarted { round_id: Uuid, model_id: String, round_number: u64, participants: Vec<NodeId> },
    UpdateSubmitted { round_id: Uuid, node_id: NodeId, sample_count: u64, received: usize, expected: usize },
    UpdateRejected { round_id: Uuid, node_id: NodeId, reason: String },
    RoundCompleted { round_id: Uuid, model_id: String, model_version: u64, contributors: usize },
    RoundFailed { round_id: Uuid, model_id: String, reason: String },
}

impl FederationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FederationEvent::NodeRegistered { .. } => "node_registered",
            FederationEvent::NodeRemoved { .. } => "node_removed",
            FederationEvent::RoundStarted { .. } => "round_started",
            FederationEvent::UpdateSubmitted { .. } => "update_submitted",
            FederationEvent::UpdateRejected { .. } => "update_rejected",
            FederationEvent::RoundCompleted { .. } => "round_completed",
            FederationEvent::RoundFailed { .. } => "round_failed",
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            FederationEvent::NodeRegistered { node_id, .. } | FederationEvent::NodeRemoved { node_id } => node_id.clone(),
            FederationEvent::RoundStarted { round_id, .. }
            | FederationEvent::UpdateSubmitted { round_id, .. }
            | FederationEvent::UpdateRejected { round_id, .. }
            | FederationEvent::RoundCompleted { round_id, .. }
            | FederationEvent::RoundFailed { round_id, .. } => round_id.to_string(),
        }
    }
}

/// Audit record handed to an [`EventSink`].
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub kind: &'static str,
    pub entity_id: String,
    pub payload: FederationEvent,
    pub timestamp: i64,
}

impl EventRecord {
    pub fn new(event: FederationEvent) -> Self {
        Self { kind: event.kind(), entity_id: event.entity_id(), payload: event, timestamp: chrono::Utc::now().timestamp_millis() }
    }
}

pub trait EventSink: Send + Sync {
    fn record_event(&self, record: EventRecord);
}

pub(crate) fn emit(sink: &dyn EventSink, event: FederationEvent) {
    sink.record_event(EventRecord::new(event));
}

/// Fan-out sink; subscribers that lag simply miss records.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<EventRecord>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> { self.tx.subscribe() }
}

impl EventSink for BroadcastEventSink {
    fn record_event(&self, record: EventRecord) {
        // no receivers is not an error for an audit stream
        let _ = self.tx.send(record);
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventSink {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<EventRecord> { self.records.lock().clone() }

    pub fn kinds(&self) -> Vec<&'static str> { self.records.lock().iter().map(|r| r.kind).collect() }
}

impl EventSink for MemoryEventSink {
    fn record_event(&self, record: EventRecord) { self.records.lock().push(record); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_records() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        emit(&sink, FederationEvent::NodeRemoved { node_id: "n1".into() });
        let rec = rx.recv().await.unwrap();
        assert_eq!(rec.kind, "node_removed");
        assert_eq!(rec.entity_id, "n1");
    }

    #[test]
    fn event_serializes_with_tag() {
        let v = serde_json::to_value(FederationEvent::NodeRegistered { node_id: "n1".into(), trust_score: 0.8 }).unwrap();
        assert_eq!(v["type"], "node_registered");
    }
}
