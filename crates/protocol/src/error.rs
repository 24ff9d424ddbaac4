//! The closed error taxonomy from spec section 7.

use uuid::Uuid;

/// Errors the engine can surface to a control client or to a running step.
#[derive(Debug, thiserror::Error)]
pub enum MockRtcError {
    /// An operation referenced an unknown peer or session.
    #[error("not found: {0}")]
    NotFound(String),

    /// A method was called on a closed connection, or a control channel /
    /// external attachment was attempted twice.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The SDP mirror could not align a section between the foreign and
    /// local descriptions.
    #[error("mirror mismatch: {0}")]
    MirrorMismatch(String),

    /// The underlying ICE/DTLS/SCTP transport entered the `failed` state.
    #[error("transport failure for session {session_id}: {reason}")]
    TransportFailure { session_id: Uuid, reason: String },

    /// A message query was made while `recordMessages` was disabled.
    #[error("recording disabled for this peer")]
    RecordingDisabled,

    /// A control-channel message failed to parse or was of an unknown kind.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The underlying ICE/DTLS/SCTP stack (`webrtc-rs`) returned an error.
    /// `mockrtc-core` converts `webrtc::Error` into this variant at the call
    /// site so this crate doesn't need a direct dependency on `webrtc`.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Wraps SDP/JSON (de)serialization failures encountered while building
    /// or mirroring a session description.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MockRtcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        let err = MockRtcError::InvalidState("connection already closed".into());
        assert_eq!(err.to_string(), "invalid state: connection already closed");

        let err = MockRtcError::TransportFailure {
            session_id: Uuid::nil(),
            reason: "ice failed".into(),
        };
        assert!(err.to_string().contains("ice failed"));
    }

    #[test]
    fn recording_disabled_has_no_payload() {
        let err = MockRtcError::RecordingDisabled;
        assert_eq!(err.to_string(), "recording disabled for this peer");
    }
}
