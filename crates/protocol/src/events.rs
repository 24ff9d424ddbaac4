//! The event taxonomy from spec sections 3 and 6.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sdp::{Candidate, MediaKind, SessionDescription, Direction};

/// `{ startTime, connectTimestamp, externalAttachTimestamp?, disconnectTimestamp? }`,
/// populated monotonically as the connection moves through its lifecycle.
/// All timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingEvents {
    pub start_time: u64,
    pub connect_timestamp: Option<u64>,
    pub external_attach_timestamp: Option<u64>,
    pub disconnect_timestamp: Option<u64>,
}

/// Free-form per-connection metadata supplied by the signalling layer
/// (`userAgent`, `sourceURL`, plus whatever else a caller attaches).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    pub user_agent: Option<String>,
    pub source_url: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A binary/text data-channel payload as it appears on an event. Binary
/// payloads are base64-encoded on the wire per spec section 6; within the
/// process we keep raw bytes and let the transport layer encode them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Sent,
    Received,
}

/// The ten event kinds from spec section 3, each carrying `peerId`,
/// `sessionId`, `eventTimestamp`, and kind-specific fields (section 6).
/// External connections never emit `PeerConnected`/`PeerDisconnected`;
/// attachment is their only externally visible lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    PeerConnected {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        metadata: ConnectionMetadata,
        timing_events: TimingEvents,
        local_session_description: SessionDescription,
        remote_session_description: SessionDescription,
        selected_local_candidate: Option<Candidate>,
        selected_remote_candidate: Option<Candidate>,
    },
    PeerDisconnected {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        timing_events: TimingEvents,
    },
    ExternalPeerAttached {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        timing_events: TimingEvents,
        external_session_id: Uuid,
        external_local_session_description: Option<SessionDescription>,
        external_remote_session_description: Option<SessionDescription>,
        external_selected_local_candidate: Option<Candidate>,
        external_selected_remote_candidate: Option<Candidate>,
    },
    DataChannelOpened {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        channel_id: u16,
        channel_label: String,
        channel_protocol: String,
    },
    DataChannelMessage {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        channel_id: u16,
        direction: MessageDirection,
        content: EventPayload,
        is_binary: bool,
    },
    DataChannelClosed {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        channel_id: u16,
    },
    MediaTrackOpened {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        track_mid: String,
        track_type: MediaKind,
        track_direction: Direction,
    },
    MediaTrackStats {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        track_mid: String,
        total_bytes_sent: u64,
        total_bytes_received: u64,
    },
    MediaTrackClosed {
        peer_id: String,
        session_id: Uuid,
        event_timestamp: u64,
        track_mid: String,
    },
}

impl Event {
    pub fn session_id(&self) -> Uuid {
        match self {
            Event::PeerConnected { session_id, .. }
            | Event::PeerDisconnected { session_id, .. }
            | Event::ExternalPeerAttached { session_id, .. }
            | Event::DataChannelOpened { session_id, .. }
            | Event::DataChannelMessage { session_id, .. }
            | Event::DataChannelClosed { session_id, .. }
            | Event::MediaTrackOpened { session_id, .. }
            | Event::MediaTrackStats { session_id, .. }
            | Event::MediaTrackClosed { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_is_kebab_case_on_the_wire() {
        let event = Event::DataChannelClosed {
            peer_id: "matching-peer".into(),
            session_id: Uuid::nil(),
            event_timestamp: 0,
            channel_id: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"data-channel-closed""#));
    }

    #[test]
    fn session_id_accessor_covers_every_variant() {
        let id = Uuid::new_v4();
        let event = Event::MediaTrackClosed {
            peer_id: "p".into(),
            session_id: id,
            event_timestamp: 0,
            track_mid: "0".into(),
        };
        assert_eq!(event.session_id(), id);
    }
}
