// src/events.rs
//
// Central event bus for meshcast.
//
// Every meaningful state change (stream lifecycle, peer lifecycle, quality
// switches) is represented as a `MeshcastEvent`.  A single `EventBus` backed
// by a `tokio::sync::broadcast` channel fans out each event to every
// consumer: the SFU (simulcast layer selection), the signaling plane
// (peer-list hints), and the metrics registry.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::QualityLabel;

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "stream.created")]
    StreamCreated,
    #[serde(rename = "stream.ended")]
    StreamEnded,
    #[serde(rename = "peer.joined")]
    PeerJoined,
    #[serde(rename = "peer.left")]
    PeerLeft,
    #[serde(rename = "quality.switched")]
    QualitySwitched,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamCreated => "stream.created",
            Self::StreamEnded => "stream.ended",
            Self::PeerJoined => "peer.joined",
            Self::PeerLeft => "peer.left",
            Self::QualitySwitched => "quality.switched",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

/// Metadata attached to stream lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub stream_id: String,
}

/// Metadata attached to peer lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPayload {
    pub stream_id: String,
    pub peer_id: String,
    pub is_publisher: bool,
}

/// Metadata attached to ABR quality switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityPayload {
    pub peer_id: String,
    pub from: QualityLabel,
    pub to: QualityLabel,
}

/// Type-safe union of all possible payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Stream(StreamPayload),
    Peer(PeerPayload),
    Quality(QualityPayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing event, ready for serialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshcastEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Type-specific payload.
    pub data: EventPayload,
}

impl MeshcastEvent {
    pub fn stream_created(stream_id: &str) -> Self {
        Self::new(
            EventType::StreamCreated,
            EventPayload::Stream(StreamPayload {
                stream_id: stream_id.to_string(),
            }),
        )
    }

    pub fn stream_ended(stream_id: &str) -> Self {
        Self::new(
            EventType::StreamEnded,
            EventPayload::Stream(StreamPayload {
                stream_id: stream_id.to_string(),
            }),
        )
    }

    pub fn peer_joined(stream_id: &str, peer_id: &str, is_publisher: bool) -> Self {
        Self::new(
            EventType::PeerJoined,
            EventPayload::Peer(PeerPayload {
                stream_id: stream_id.to_string(),
                peer_id: peer_id.to_string(),
                is_publisher,
            }),
        )
    }

    pub fn peer_left(stream_id: &str, peer_id: &str, is_publisher: bool) -> Self {
        Self::new(
            EventType::PeerLeft,
            EventPayload::Peer(PeerPayload {
                stream_id: stream_id.to_string(),
                peer_id: peer_id.to_string(),
                is_publisher,
            }),
        )
    }

    pub fn quality_switched(peer_id: &str, from: QualityLabel, to: QualityLabel) -> Self {
        Self::new(
            EventType::QualitySwitched,
            EventPayload::Quality(QualityPayload {
                peer_id: peer_id.to_string(),
                from,
                to,
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `MeshcastEvent`.
///
/// Capacity is generous (4096 events) -- subscribers that lag more than that
/// will skip events (same semantic as `broadcast::RecvError::Lagged`).
///
/// The bus is **cheap to clone** (interior `Arc`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshcastEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx }
    }

    /// Publish an event.  Returns the number of active subscribers that will
    /// receive it.  Silently succeeds even if there are no subscribers.
    pub fn emit(&self, event: MeshcastEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver.  Each receiver gets an independent copy of
    /// every event published *after* this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshcastEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serialization() {
        let json = serde_json::to_string(&EventType::PeerJoined).unwrap();
        assert_eq!(json, "\"peer.joined\"");

        let parsed: EventType = serde_json::from_str("\"stream.created\"").unwrap();
        assert_eq!(parsed, EventType::StreamCreated);
    }

    #[test]
    fn event_envelope_json() {
        let evt = MeshcastEvent::stream_created("stream_1");
        let json = serde_json::to_string_pretty(&evt).unwrap();
        assert!(json.contains("\"type\": \"stream.created\""));
        assert!(json.contains("\"stream_id\": \"stream_1\""));
        assert!(evt.id.starts_with("evt_"));
    }

    #[test]
    fn quality_switch_payload() {
        let evt =
            MeshcastEvent::quality_switched("p-1", QualityLabel::High, QualityLabel::Medium);
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains("\"from\":\"high\""));
        assert!(json.contains("\"to\":\"medium\""));
    }

    #[tokio::test]
    async fn bus_fanout() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let evt = MeshcastEvent::peer_joined("s1", "p1", true);
        let n = bus.emit(evt.clone());
        assert_eq!(n, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.id, e2.id);
    }
}
