//! The RTP analogue of [`super::data_channel::DataChannelStream`]: a duplex
//! byte stream for a single m-section (spec.md section 4.2). Grounded on the
//! reflect example's track-remote read loop / track-local write loop
//! (`TrackRemote::read_rtp`, `TrackLocalStaticRTP::write_rtp`), generalized
//! to track per-direction byte counters and a suppressed-on-no-change stats
//! tick instead of blindly reflecting packets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mockrtc_protocol::{Direction, MediaKind};
use rtp::packet::Packet as RtpPacket;
use tokio::sync::broadcast;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::error::IntoMockRtcError;

#[derive(Debug, Clone)]
pub enum TrackEvent {
    Open,
    /// Every inbound RTP packet, independent of the stats tick -- the media
    /// analogue of `DataChannelStream`'s `read-data`, used by the `echo` step
    /// to loop media back without waiting on a stats interval.
    Packet(RtpPacket),
    Stats { sent: u64, received: u64 },
    Close,
}

/// One negotiated media m-section: a local send track plus, once the remote
/// side starts sending, the matching `TrackRemote`. Either half may be
/// absent depending on `direction` (e.g. `sendonly` never gets a remote).
pub struct MediaTrackStream {
    mid: String,
    kind: MediaKind,
    direction: Direction,
    is_open: Arc<AtomicBool>,
    local: Option<Arc<TrackLocalStaticRTP>>,
    remote: Option<Arc<TrackRemote>>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    events: broadcast::Sender<TrackEvent>,
}

impl MediaTrackStream {
    pub fn new(
        mid: String,
        kind: MediaKind,
        direction: Direction,
        local: Option<Arc<TrackLocalStaticRTP>>,
        remote: Option<Arc<TrackRemote>>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let bytes_received = Arc::new(AtomicU64::new(0));

        if let Some(remote) = &remote {
            let remote = Arc::clone(remote);
            let received = Arc::clone(&bytes_received);
            let track_events = events.clone();
            tokio::spawn(async move {
                while let Ok((packet, _)) = remote.read_rtp().await {
                    received.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                    let _ = track_events.send(TrackEvent::Packet(packet));
                }
                let _ = track_events.send(TrackEvent::Close);
            });
        }

        let _ = events.send(TrackEvent::Open);

        Self {
            mid,
            kind,
            direction,
            is_open: Arc::new(AtomicBool::new(true)),
            local,
            remote,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received,
            events,
        }
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.events.subscribe()
    }

    /// Write a single RTP packet. A write after the remote track has
    /// reported closed drops silently and transitions this stream to
    /// closed, mirroring the "writes fail, then close event" ordering spec.md
    /// section 4.2 calls out.
    pub async fn write(&self, packet: &RtpPacket) -> Result<(), mockrtc_protocol::MockRtcError> {
        let Some(local) = &self.local else {
            return Ok(());
        };
        if !self.is_open() {
            return Ok(());
        }
        match local.write_rtp(packet).await {
            Ok(_) => {
                self.bytes_sent
                    .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.is_open.store(false, Ordering::SeqCst);
                let _ = self.events.send(TrackEvent::Close);
                Err(err).transport_err()
            }
        }
    }

    pub fn close(&self) {
        if self.is_open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TrackEvent::Close);
        }
    }

    /// Emit a `media-track-stats` tick unless both counters are unchanged
    /// since the caller's last observation (spec.md section 6).
    pub fn maybe_emit_stats(&self, last_sent: u64, last_received: u64) -> Option<(u64, u64)> {
        let sent = self.total_bytes_sent();
        let received = self.total_bytes_received();
        if sent == last_sent && received == last_received {
            return None;
        }
        let _ = self.events.send(TrackEvent::Stats { sent, received });
        Some((sent, received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_track_is_open_with_zero_counters() {
        let stream = MediaTrackStream::new(
            "0".to_string(),
            MediaKind::Audio,
            Direction::Sendrecv,
            None,
            None,
        );
        assert!(stream.is_open());
        assert_eq!(stream.total_bytes_sent(), 0);
        assert_eq!(stream.total_bytes_received(), 0);
    }

    #[test]
    fn stats_tick_suppressed_when_unchanged() {
        let stream = MediaTrackStream::new(
            "0".to_string(),
            MediaKind::Video,
            Direction::Sendonly,
            None,
            None,
        );
        assert!(stream.maybe_emit_stats(0, 0).is_none());
    }

    #[test]
    fn close_transitions_is_open_to_false() {
        let stream = MediaTrackStream::new(
            "0".to_string(),
            MediaKind::Video,
            Direction::Sendonly,
            None,
            None,
        );
        stream.close();
        assert!(!stream.is_open());
    }
}
