//! Event model for real-time client communication.
//!
//! This module provides:
//! - [`HubEvent`], the tagged union of every textual message the broadcast
//!   hub can deliver to subscribers
//! - [`ControlChannelEvent`], a classified decoder log line
//! - [`EventEmitter`] trait for domain services to emit events
//!
//! The actual transport (per-subscriber queues, WebSocket framing) is handled
//! by the `hub` module; services only ever see [`EventEmitter`].

mod bridge;
mod emitter;

pub use bridge::HubEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::{Deserialize, Serialize};

use crate::calls::{CallSource, SystemType};

/// Kind of a classified control-channel log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEventKind {
    Grant,
    Update,
    End,
    Encrypted,
    OutOfBand,
    NoRecorder,
    DecodeRate,
    SystemInfo,
    Unit,
}

/// A classified control-channel log line.
///
/// Optional fields are populated per kind: a grant carries talkgroup,
/// frequency and recorder index; a decode-rate line carries only the rate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlChannelEvent {
    /// Wall-clock timestamp, Unix milliseconds.
    pub timestamp: u64,
    pub kind: ControlEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talkgroup: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talkgroup_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorder: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wacn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    /// The raw log line the event was classified from.
    pub raw: String,
}

impl ControlChannelEvent {
    /// Creates an event of the given kind with every optional field unset.
    #[must_use]
    pub fn new(kind: ControlEventKind, timestamp: u64, raw: String) -> Self {
        Self {
            timestamp,
            kind,
            talkgroup: None,
            talkgroup_tag: None,
            frequency: None,
            recorder: None,
            source: None,
            slot: None,
            decode_rate: None,
            wacn: None,
            nac: None,
            system_id: None,
            raw,
        }
    }
}

/// Payload of a `call_start` broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStartEvent {
    pub id: String,
    /// Topic key subscribers filter on (talkgroup or frequency).
    pub channel_key: u64,
    pub talkgroup: u64,
    pub frequency: u64,
    pub label: String,
    pub system_type: SystemType,
    pub start_time: u64,
    pub emergency: bool,
    pub encrypted: bool,
}

/// Payload of a `call_end` broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndEvent {
    pub id: String,
    pub channel_key: u64,
    pub talkgroup: u64,
    pub frequency: u64,
    pub label: String,
    pub system_type: SystemType,
    pub start_time: u64,
    pub stop_time: u64,
    pub duration: f64,
    pub emergency: bool,
    pub encrypted: bool,
    /// Absolute path of the recorded audio.
    pub audio_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_type: Option<String>,
    pub sources: Vec<CallSource>,
}

/// Payload of a `new_recording` broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecordingEvent {
    pub id: String,
    pub channel_key: u64,
    pub talkgroup: u64,
    pub frequency: u64,
    pub label: String,
    pub audio_file: String,
    pub duration: f64,
}

/// How a [`HubEvent`] is routed across subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Delivered to every subscriber.
    Everyone,
    /// Delivered when the subscriber's topic filter matches the key.
    Topic(u64),
    /// Delivered when audio is enabled AND the topic filter matches.
    AudioTopic(u64),
}

/// Textual messages delivered to subscribers.
///
/// Binary audio/FFT frames do not pass through this enum; they are framed
/// separately by the hub (`hub::frame`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// Unicast greeting at connect, carrying recent control events.
    Connected {
        subscriber_id: String,
        recent_control: Vec<ControlChannelEvent>,
    },
    CallStart(CallStartEvent),
    CallEnd(Box<CallEndEvent>),
    CallsActive { calls: Vec<CallStartEvent> },
    NewRecording(NewRecordingEvent),
    ControlChannel(ControlChannelEvent),
    Rates { rates: serde_json::Value },
    SystemChanged { payload: serde_json::Value },
    ReplayProgress { recording_id: String, percent: f32 },
    Error { error: String },
}

impl HubEvent {
    /// Returns how this event is routed across subscribers.
    #[must_use]
    pub fn routing(&self) -> Routing {
        match self {
            Self::CallStart(e) => Routing::Topic(e.channel_key),
            Self::CallEnd(e) => Routing::Topic(e.channel_key),
            Self::NewRecording(e) => Routing::AudioTopic(e.channel_key),
            _ => Routing::Everyone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_events_serialize_with_snake_case_type_tag() {
        let event = HubEvent::Error {
            error: "unknown command".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "unknown command");

        let event = HubEvent::CallStart(CallStartEvent {
            id: "927-1704825600".into(),
            channel_key: 927,
            talkgroup: 927,
            frequency: 851_150_000,
            label: "Control A2".into(),
            system_type: SystemType::Trunked,
            start_time: 1_704_825_600,
            emergency: false,
            encrypted: false,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "call_start");
        assert_eq!(json["id"], "927-1704825600");
        assert_eq!(json["systemType"], "trunked");
    }

    #[test]
    fn call_events_route_by_topic() {
        let event = HubEvent::Rates {
            rates: serde_json::json!({}),
        };
        assert_eq!(event.routing(), Routing::Everyone);

        let event = HubEvent::NewRecording(NewRecordingEvent {
            id: "927-1".into(),
            channel_key: 927,
            talkgroup: 927,
            frequency: 851_150_000,
            label: "Control A2".into(),
            audio_file: "/audio/927-1.wav".into(),
            duration: 10.0,
        });
        assert_eq!(event.routing(), Routing::AudioTopic(927));
    }

    #[test]
    fn control_events_skip_empty_fields() {
        let event = ControlChannelEvent::new(ControlEventKind::End, 1, "line".into());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "end");
        assert!(json.get("talkgroup").is_none());
        assert!(json.get("decodeRate").is_none());
    }
}
