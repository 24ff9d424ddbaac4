//! A single SCTP data channel presented as a duplex message stream
//! (spec.md section 4.1). Grounded on the teacher's data channel wiring in
//! `WebRTCPeer::on_input_event`/`send_data_channel_message` -- open/message
//! callbacks registered once at construction, state read back through an
//! `Arc`-shared handle -- generalized from a single fixed "input" channel to
//! an arbitrary tracked channel with its own event stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mockrtc_protocol::MockRtcError;
use tokio::sync::{broadcast, Mutex};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::error::IntoMockRtcError;

/// A single data-channel message, preserving the wire-level text/binary
/// distinction end to end (spec.md section 4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    fn from_wire(msg: DataChannelMessage) -> Self {
        if msg.is_string {
            Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            Payload::Binary(msg.data)
        }
    }
}

/// Events emitted by a [`DataChannelStream`], spec.md section 4.1.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    ReadData(Payload),
    WroteData(Payload),
    Close,
    Error(String),
}

/// Duplex view over a single `RTCDataChannel`. Constructed both for
/// locally-created channels (`create-channel` step, control channel) and for
/// channels the remote side opened (`on_data_channel`).
pub struct DataChannelStream {
    channel: Arc<RTCDataChannel>,
    label: String,
    protocol: String,
    is_open: Arc<AtomicBool>,
    is_local: bool,
    events: broadcast::Sender<ChannelEvent>,
    /// Readable high-water-mark queue. Best-effort: the underlying SCTP
    /// transport has its own buffering, this just bounds how much we hold
    /// onto past what a consumer has drained via `read-data`.
    queue: Arc<Mutex<VecDeque<Payload>>>,
    high_water_mark: usize,
}

impl DataChannelStream {
    /// Wrap an already-created or already-remote-opened channel and wire up
    /// its callbacks. `is_local` distinguishes `channel-created` vs
    /// `remote-channel-created` at the [`super::Connection`] level.
    pub fn wrap(channel: Arc<RTCDataChannel>, is_local: bool, high_water_mark: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        let label = channel.label().to_string();
        let protocol = channel.protocol().to_string();
        let is_open = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(Mutex::new(VecDeque::new()));

        let stream = Self {
            channel: Arc::clone(&channel),
            label,
            protocol,
            is_open: Arc::clone(&is_open),
            is_local,
            events: events.clone(),
            queue: Arc::clone(&queue),
            high_water_mark,
        };

        let open_flag = Arc::clone(&is_open);
        let open_events = events.clone();
        channel.on_open(Box::new(move || {
            open_flag.store(true, Ordering::SeqCst);
            let _ = open_events.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let message_events = events.clone();
        let message_queue = Arc::clone(&queue);
        let hwm = high_water_mark;
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let payload = Payload::from_wire(msg);
            let _ = message_events.send(ChannelEvent::ReadData(payload.clone()));
            let queue = Arc::clone(&message_queue);
            Box::pin(async move {
                let mut queue = queue.lock().await;
                if queue.len() < hwm {
                    queue.push_back(payload);
                } else {
                    tracing::debug!(over_capacity = hwm, "dropping queued data channel message");
                }
            })
        }));

        let close_flag = Arc::clone(&is_open);
        let close_events = events.clone();
        channel.on_close(Box::new(move || {
            close_flag.store(false, Ordering::SeqCst);
            let _ = close_events.send(ChannelEvent::Close);
            Box::pin(async {})
        }));

        let error_events = events.clone();
        channel.on_error(Box::new(move |err| {
            let _ = error_events.send(ChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }));

        stream
    }

    pub fn id(&self) -> u16 {
        self.channel.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Pop the oldest queued inbound message, if any. Used by `wait-for-message`
    /// to check for an already-buffered message before attaching a listener.
    pub async fn pop_queued(&self) -> Option<Payload> {
        self.queue.lock().await.pop_front()
    }

    pub async fn send(&self, payload: Payload) -> Result<(), MockRtcError> {
        let result = match &payload {
            Payload::Text(text) => self.channel.send_text(text.clone()).await.map(|_| ()),
            Payload::Binary(bytes) => self.channel.send(bytes).await.map(|_| ()),
        };
        result.transport_err()?;
        let _ = self.events.send(ChannelEvent::WroteData(payload));
        Ok(())
    }

    pub async fn close(&self) -> Result<(), MockRtcError> {
        self.channel.close().await.transport_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_reports_binary_correctly() {
        assert!(!Payload::Text("hi".into()).is_binary());
        assert!(Payload::Binary(Bytes::from_static(b"hi")).is_binary());
    }
}
