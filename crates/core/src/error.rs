//! Conversions from the underlying WebRTC stack's error type into the
//! shared [`MockRtcError`] taxonomy. Kept separate from
//! `mockrtc_protocol::error` so that crate doesn't need a dependency on
//! `webrtc` just to define its error enum.

use mockrtc_protocol::MockRtcError;

pub(crate) trait IntoMockRtcError<T> {
    fn transport_err(self) -> Result<T, MockRtcError>;
}

impl<T> IntoMockRtcError<T> for Result<T, webrtc::Error> {
    fn transport_err(self) -> Result<T, MockRtcError> {
        self.map_err(|e| MockRtcError::TransportError(e.to_string()))
    }
}
