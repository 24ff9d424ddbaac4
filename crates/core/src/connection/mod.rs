//! One ICE/DTLS/SCTP peer connection and everything hanging off it
//! (spec.md section 4.3). Grounded on `WebRTCPeer::new`/`handle_offer` for
//! the `APIBuilder`/`MediaEngine`/offer-answer dance, generalized from a
//! single fixed video+audio+input layout to an arbitrary tracked set of
//! channels and tracks driven by the SDP Mirror.

pub mod data_channel;
pub mod media_track;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mockrtc_protocol::{
    Candidate, CandidateType, ConnectionMetadata, Direction, MediaKind, ParsedSdp,
    SessionDescription, TimingEvents, TransportProtocol,
};
use mockrtc_protocol::MockRtcError;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::config::EngineConfig;
use crate::error::IntoMockRtcError;
use data_channel::DataChannelStream;
use media_track::MediaTrackStream;

/// Label of the temporary channel created to force ICE gathering when a
/// Connection has no media or data channel of its own yet (spec.md 4.3/4.4).
pub const SETUP_CHANNEL_LABEL: &str = "mockrtc.setup-channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Gathering,
    Connected,
    Disconnected,
    Closed,
}

pub struct TrackedChannel {
    pub stream: Arc<DataChannelStream>,
}

pub struct TrackedTrack {
    pub stream: Arc<MediaTrackStream>,
}

/// Internal signals a [`Connection`] emits as its underlying stack reports
/// state changes. `crate::peer::Peer` translates these into the public
/// `mockrtc_protocol::Event` taxonomy; `crate::runtime` listens to the same
/// stream to drive step suspension points.
#[derive(Debug, Clone)]
pub enum ConnectionSignal {
    Connected,
    Disconnected,
    Failed,
    Closed,
    ChannelCreated { stream: Arc<DataChannelStream>, is_local: bool },
    ChannelOpen { stream: Arc<DataChannelStream>, is_local: bool },
    TrackCreated { stream: Arc<MediaTrackStream>, is_local: bool },
    TrackOpen { stream: Arc<MediaTrackStream>, is_local: bool },
}

#[derive(Debug, Clone, Default)]
pub struct CreateOfferOptions {
    pub mirror_sdp: Option<ParsedSdp>,
    pub add_data_stream: bool,
    pub connection_metadata: ConnectionMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct AnswerOfferOptions {
    pub mirror_sdp: Option<ParsedSdp>,
    pub connection_metadata: ConnectionMetadata,
}

pub struct Connection {
    id: Uuid,
    config: Arc<EngineConfig>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    metadata: Mutex<ConnectionMetadata>,
    channels: Mutex<Vec<TrackedChannel>>,
    tracks: Mutex<Vec<TrackedTrack>>,
    state: Mutex<ConnectionState>,
    timing: Mutex<TimingEvents>,
    closed: AtomicBool,
    signals: broadcast::Sender<ConnectionSignal>,
}

impl Connection {
    pub async fn new(config: Arc<EngineConfig>) -> Result<Self, MockRtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().transport_err()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).transport_err()?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .transport_err()?,
        );

        let (signals, _) = broadcast::channel(256);
        let id = Uuid::new_v4();

        let state_signals = signals.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s| {
            let signal = match s {
                RTCPeerConnectionState::Connected => Some(ConnectionSignal::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectionSignal::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectionSignal::Failed),
                RTCPeerConnectionState::Closed => Some(ConnectionSignal::Closed),
                _ => None,
            };
            if let Some(signal) = signal {
                let _ = state_signals.send(signal);
            }
            Box::pin(async {})
        }));

        let connection = Self {
            id,
            config,
            peer_connection: Mutex::new(Some(Arc::clone(&peer_connection))),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            metadata: Mutex::new(ConnectionMetadata::default()),
            channels: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::New),
            timing: Mutex::new(TimingEvents {
                start_time: now_millis(),
                ..Default::default()
            }),
            closed: AtomicBool::new(false),
            signals,
        };

        Ok(connection)
    }

    /// Wire `on_data_channel` / `on_track` once the Connection is fully
    /// constructed (needs `Arc<Self>` for the closures to hold a back
    /// reference, so it can't happen inside `new`).
    pub async fn install_remote_observers(self: &Arc<Self>) -> Result<(), MockRtcError> {
        let pc = self.ensure_open().await?;
        let high_water_mark = self.config.data_channel_high_water_mark;

        let this = Arc::clone(self);
        pc.on_data_channel(Box::new(move |dc| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.track_remote_channel(dc, high_water_mark).await;
            })
        }));

        let this = Arc::clone(self);
        pc.on_track(Box::new(move |track, _receiver, transceiver| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let mid = transceiver.mid().unwrap_or_default();
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                this.track_remote_media(mid, kind, track).await;
            })
        }));

        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn metadata(&self) -> ConnectionMetadata {
        self.metadata.lock().await.clone()
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().await.clone()
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().await.clone()
    }

    pub async fn timing_events(&self) -> TimingEvents {
        self.timing.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    pub async fn channels(&self) -> Vec<Arc<DataChannelStream>> {
        self.channels
            .lock()
            .await
            .iter()
            .map(|c| Arc::clone(&c.stream))
            .collect()
    }

    pub async fn tracks(&self) -> Vec<Arc<MediaTrackStream>> {
        self.tracks
            .lock()
            .await
            .iter()
            .map(|t| Arc::clone(&t.stream))
            .collect()
    }

    async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty() && self.tracks.lock().await.is_empty()
    }

    /// Called whenever we wait on a connection state change: flips the
    /// tracked lifecycle state and stamps the matching timing event.
    pub async fn note_connected(&self) {
        *self.state.lock().await = ConnectionState::Connected;
        self.timing.lock().await.connect_timestamp = Some(now_millis());
    }

    pub async fn note_disconnected(&self) {
        *self.state.lock().await = ConnectionState::Disconnected;
        self.timing.lock().await.disconnect_timestamp = Some(now_millis());
    }

    pub async fn merge_metadata(&self, extra: ConnectionMetadata) {
        let mut metadata = self.metadata.lock().await;
        if extra.user_agent.is_some() {
            metadata.user_agent = extra.user_agent;
        }
        if extra.source_url.is_some() {
            metadata.source_url = extra.source_url;
        }
        metadata.extra.extend(extra.extra);
    }

    fn ensure_open_sync(&self) -> Result<(), MockRtcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MockRtcError::InvalidState(
                "method called on a closed connection".into(),
            ));
        }
        Ok(())
    }

    pub(crate) async fn ensure_open(&self) -> Result<Arc<RTCPeerConnection>, MockRtcError> {
        self.ensure_open_sync()?;
        self.peer_connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| MockRtcError::InvalidState("method called on a closed connection".into()))
    }

    pub async fn create_data_channel(
        self: &Arc<Self>,
        label: &str,
    ) -> Result<Arc<DataChannelStream>, MockRtcError> {
        let pc = self.ensure_open().await?;
        let raw = pc
            .create_data_channel(label, None)
            .await
            .transport_err()?;
        Ok(self
            .track_local_channel(raw, self.config.data_channel_high_water_mark)
            .await)
    }

    async fn track_local_channel(
        self: &Arc<Self>,
        raw: Arc<webrtc::data_channel::RTCDataChannel>,
        high_water_mark: usize,
    ) -> Arc<DataChannelStream> {
        let stream = Arc::new(DataChannelStream::wrap(raw, true, high_water_mark));
        self.channels.lock().await.push(TrackedChannel {
            stream: Arc::clone(&stream),
        });
        let _ = self.signals.send(ConnectionSignal::ChannelCreated {
            stream: Arc::clone(&stream),
            is_local: true,
        });
        self.watch_channel_open(Arc::clone(&stream), true);
        stream
    }

    async fn track_remote_channel(
        self: &Arc<Self>,
        raw: Arc<webrtc::data_channel::RTCDataChannel>,
        high_water_mark: usize,
    ) -> Arc<DataChannelStream> {
        let stream = Arc::new(DataChannelStream::wrap(raw, false, high_water_mark));
        self.channels.lock().await.push(TrackedChannel {
            stream: Arc::clone(&stream),
        });
        let _ = self.signals.send(ConnectionSignal::ChannelCreated {
            stream: Arc::clone(&stream),
            is_local: false,
        });
        self.watch_channel_open(Arc::clone(&stream), false);
        stream
    }

    /// Emits `channel-open` once the channel opens (immediately if it already
    /// has), and removes it from the tracked list on its `close` event --
    /// "each tracked stream auto-removes itself from the list on its close
    /// event" (spec.md section 4.3).
    fn watch_channel_open(self: &Arc<Self>, stream: Arc<DataChannelStream>, is_local: bool) {
        if stream.is_open() {
            let _ = self.signals.send(ConnectionSignal::ChannelOpen {
                stream: Arc::clone(&stream),
                is_local,
            });
        }
        let this = Arc::clone(self);
        let mut events = stream.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    data_channel::ChannelEvent::Open => {
                        let _ = this.signals.send(ConnectionSignal::ChannelOpen {
                            stream: Arc::clone(&stream),
                            is_local,
                        });
                    }
                    data_channel::ChannelEvent::Close => {
                        this.channels
                            .lock()
                            .await
                            .retain(|c| !Arc::ptr_eq(&c.stream, &stream));
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    async fn track_remote_media(
        self: &Arc<Self>,
        mid: String,
        kind: MediaKind,
        track: Arc<webrtc::track::track_remote::TrackRemote>,
    ) {
        let stream = Arc::new(MediaTrackStream::new(
            mid,
            kind,
            Direction::Recvonly,
            None,
            Some(track),
        ));
        self.tracks.lock().await.push(TrackedTrack {
            stream: Arc::clone(&stream),
        });
        let _ = self.signals.send(ConnectionSignal::TrackCreated {
            stream: Arc::clone(&stream),
            is_local: false,
        });
        let _ = self.signals.send(ConnectionSignal::TrackOpen {
            stream: Arc::clone(&stream),
            is_local: false,
        });
        self.watch_track_close(stream);
    }

    pub(crate) async fn add_local_media_track(
        self: &Arc<Self>,
        mid: &str,
        kind: MediaKind,
        direction: Direction,
        capability: RTCRtpCodecCapability,
    ) -> Result<Arc<MediaTrackStream>, MockRtcError> {
        let pc = self.ensure_open().await?;
        let stream_id = format!("mockrtc-{}", self.id);
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            mid.to_string(),
            stream_id,
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .transport_err()?;

        let stream = Arc::new(MediaTrackStream::new(
            mid.to_string(),
            kind,
            direction,
            Some(track),
            None,
        ));
        self.tracks.lock().await.push(TrackedTrack {
            stream: Arc::clone(&stream),
        });
        let _ = self.signals.send(ConnectionSignal::TrackCreated {
            stream: Arc::clone(&stream),
            is_local: true,
        });
        let _ = self.signals.send(ConnectionSignal::TrackOpen {
            stream: Arc::clone(&stream),
            is_local: true,
        });
        self.watch_track_close(Arc::clone(&stream));
        Ok(stream)
    }

    /// Removes a track from the tracked list on its `close` event, the same
    /// auto-removal contract `watch_channel_open` gives channels (spec.md
    /// section 4.3).
    fn watch_track_close(self: &Arc<Self>, stream: Arc<MediaTrackStream>) {
        let this = Arc::clone(self);
        let mut events = stream.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, media_track::TrackEvent::Close) {
                    this.tracks
                        .lock()
                        .await
                        .retain(|t| !Arc::ptr_eq(&t.stream, &stream));
                    break;
                }
            }
        });
    }

    /// Drive the stack to produce a local offer and wait for ICE gathering
    /// to complete (spec.md section 4.4 rule 3).
    pub(crate) async fn build_local_offer(&self) -> Result<SessionDescription, MockRtcError> {
        let pc = self.ensure_open().await?;
        let offer = pc.create_offer(None).await.transport_err()?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.transport_err()?;
        let _ = gather_complete.recv().await;
        *self.state.lock().await = ConnectionState::Gathering;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| MockRtcError::TransportError("no local description after gathering".into()))?;
        let description = SessionDescription::offer(local.sdp);
        *self.local_description.lock().await = Some(description.clone());
        Ok(description)
    }

    pub(crate) async fn build_local_answer(&self) -> Result<SessionDescription, MockRtcError> {
        let pc = self.ensure_open().await?;
        let answer = pc.create_answer(None).await.transport_err()?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await.transport_err()?;
        let _ = gather_complete.recv().await;
        *self.state.lock().await = ConnectionState::Gathering;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| MockRtcError::TransportError("no local description after gathering".into()))?;
        let description = SessionDescription::answer(local.sdp);
        *self.local_description.lock().await = Some(description.clone());
        Ok(description)
    }

    pub(crate) async fn set_remote(&self, description: &SessionDescription) -> Result<(), MockRtcError> {
        let pc = self.ensure_open().await?;
        let rtc_description = match description.kind {
            mockrtc_protocol::SdpType::Offer => {
                RTCSessionDescription::offer(description.sdp.clone()).transport_err()?
            }
            mockrtc_protocol::SdpType::Answer => {
                RTCSessionDescription::answer(description.sdp.clone()).transport_err()?
            }
        };
        pc.set_remote_description(rtc_description)
            .await
            .transport_err()?;
        *self.remote_description.lock().await = Some(description.clone());
        Ok(())
    }

    /// `createOffer(opts)`, spec.md section 4.3.
    pub async fn create_offer(
        self: &Arc<Self>,
        opts: CreateOfferOptions,
    ) -> Result<SessionDescription, MockRtcError> {
        self.merge_metadata(opts.connection_metadata.clone()).await;

        if let Some(mirror) = opts.mirror_sdp.clone() {
            return crate::sdp_mirror::mirror_for_offer(self, &mirror, opts.add_data_stream).await;
        }

        let needs_setup_channel = opts.add_data_stream || self.is_empty().await;
        let setup_channel = if needs_setup_channel {
            Some(self.create_data_channel(SETUP_CHANNEL_LABEL).await?)
        } else {
            None
        };

        let offer = self.build_local_offer().await?;

        if let Some(channel) = setup_channel {
            channel.close().await?;
        }

        Ok(offer)
    }

    /// `answerOffer(offer, opts)`, spec.md section 4.3.
    pub async fn answer_offer(
        self: &Arc<Self>,
        offer: SessionDescription,
        opts: AnswerOfferOptions,
    ) -> Result<SessionDescription, MockRtcError> {
        self.merge_metadata(opts.connection_metadata.clone()).await;
        self.set_remote(&offer).await?;

        if let Some(mirror) = opts.mirror_sdp.clone() {
            return crate::sdp_mirror::mirror_for_answer(self, &mirror).await;
        }

        self.build_local_answer().await
    }

    /// `completeOffer(answer)`, spec.md section 4.3.
    pub async fn complete_offer(&self, answer: SessionDescription) -> Result<(), MockRtcError> {
        self.set_remote(&answer).await
    }

    /// Selected candidate pair, read back from `get_stats()` once connected
    /// (spec.md section 12: exposed once on `peer-connected`, not polled).
    pub async fn selected_candidate_pair(&self) -> (Option<Candidate>, Option<Candidate>) {
        let Some(pc) = self.peer_connection.lock().await.clone() else {
            return (None, None);
        };
        let stats = pc.get_stats().await;
        let mut local = None;
        let mut remote = None;
        for (_, report) in stats.reports.iter() {
            if let StatsReportType::LocalCandidate(candidate) = report {
                local = Some(Candidate {
                    address: candidate.ip.clone(),
                    port: candidate.port as u16,
                    protocol: parse_transport_protocol(&candidate.protocol),
                    candidate_type: parse_candidate_type(&candidate.candidate_type),
                });
            }
            if let StatsReportType::RemoteCandidate(candidate) = report {
                remote = Some(Candidate {
                    address: candidate.ip.clone(),
                    port: candidate.port as u16,
                    protocol: parse_transport_protocol(&candidate.protocol),
                    candidate_type: parse_candidate_type(&candidate.candidate_type),
                });
            }
        }
        (local, remote)
    }

    /// Close semantics from spec.md section 4.3: the raw handle is cleared
    /// first so stray post-close calls can't reach it, then the connection
    /// moves to `closed` and emits `Closed`.
    pub async fn close(&self) -> Result<(), MockRtcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pc = self.peer_connection.lock().await.take();
        *self.state.lock().await = ConnectionState::Closed;
        if let Some(pc) = pc {
            pc.close().await.transport_err()?;
        }
        let _ = self.signals.send(ConnectionSignal::Closed);
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_transport_protocol(protocol: &str) -> TransportProtocol {
    if protocol.eq_ignore_ascii_case("tcp") {
        TransportProtocol::Tcp
    } else {
        TransportProtocol::Udp
    }
}

fn parse_candidate_type(candidate_type: &str) -> CandidateType {
    match candidate_type {
        "srflx" => CandidateType::Srflx,
        "prflx" => CandidateType::Prflx,
        "relay" => CandidateType::Relay,
        _ => CandidateType::Host,
    }
}

/// Build an RTP codec capability close enough to a mirrored `MediaSection`'s
/// advertised `rtpmap` to keep payload type and clock rate aligned; exact
/// fmtp negotiation stays with the underlying stack.
pub(crate) fn capability_from_rtpmap(kind: MediaKind, rtp: &BTreeMap<u8, String>, payload: u8) -> RTCRtpCodecCapability {
    let encoding = rtp.get(&payload).cloned().unwrap_or_default();
    let mut parts = encoding.splitn(3, '/');
    let name = parts.next().unwrap_or("opus");
    let clock_rate: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(match kind {
        MediaKind::Audio => 48000,
        _ => 90000,
    });
    let channels: u16 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let mime_type = match kind {
        MediaKind::Audio => format!("audio/{}", name.to_uppercase()),
        MediaKind::Video => format!("video/{}", name.to_uppercase()),
        MediaKind::Application => String::new(),
    };
    RTCRtpCodecCapability {
        mime_type,
        clock_rate,
        channels,
        ..Default::default()
    }
}
