//! `Peer`: a step-list provider plus the connections it owns (spec.md
//! section 4.7). Grounded on the teacher's `Room`/`Session` registry
//! (`HashMap<Uuid, Arc<Session>>` keyed by session id, closed in parallel on
//! teardown), generalized to also hold unassigned external connections and
//! recorded messages.

use std::collections::HashMap;
use std::sync::Arc;

use mockrtc_protocol::{
    Event, EventPayload, MatcherDefinition, MessageDirection, MockRtcError, Rule, SessionDescription,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::connection::data_channel::{ChannelEvent, DataChannelStream, Payload};
use crate::connection::media_track::{MediaTrackStream, TrackEvent};
use crate::connection::{
    AnswerOfferOptions, Connection, ConnectionSignal, ConnectionState, CreateOfferOptions,
};
use crate::mock_connection::{MockConnection, MockConnectionSignal, UnassignedExternals};
use crate::runtime::{self, matchers, AnswerResolver};

/// Either a fixed step list (a built peer) or the matching peer's live rule
/// list, evaluated against the connecting Connection once it reports
/// `connection-connected` (spec.md section 4.8).
pub enum StepsProvider {
    Fixed(Vec<mockrtc_protocol::StepDefinition>),
    Matching(Arc<Mutex<Vec<Rule>>>),
}

impl StepsProvider {
    /// Resolves the step list for a freshly created session. For
    /// `Matching`, waits for `connection-connected` first -- rule matchers
    /// read parsed SDP and metadata that only exist once negotiation has
    /// completed (spec.md section 4.8).
    async fn resolve(
        &self,
        connection: &Connection,
        connection_signals: &mut broadcast::Receiver<ConnectionSignal>,
    ) -> Vec<mockrtc_protocol::StepDefinition> {
        match self {
            StepsProvider::Fixed(steps) => steps.clone(),
            StepsProvider::Matching(rules) => {
                wait_for_connected(connection, connection_signals).await;
                let rules = rules.lock().await;
                for rule in rules.iter() {
                    if all_match(&rule.matchers, connection).await {
                        return rule.steps.clone();
                    }
                }
                vec![mockrtc_protocol::StepDefinition::DynamicProxy]
            }
        }
    }
}

async fn wait_for_connected(connection: &Connection, signals: &mut broadcast::Receiver<ConnectionSignal>) {
    if connection.state().await == ConnectionState::Connected {
        return;
    }
    loop {
        match signals.recv().await {
            Ok(ConnectionSignal::Connected) | Ok(ConnectionSignal::Closed) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

async fn all_match(defs: &[MatcherDefinition], connection: &Connection) -> bool {
    for matcher in defs {
        if !matchers::evaluate(matcher, connection).await {
            return false;
        }
    }
    true
}

pub struct Peer {
    id: String,
    config: Arc<EngineConfig>,
    connections: Mutex<HashMap<Uuid, Arc<MockConnection>>>,
    unassigned_externals: UnassignedExternals,
    steps: StepsProvider,
    resolver: Arc<dyn AnswerResolver>,
    record_messages: bool,
    messages: Mutex<HashMap<String, Vec<Payload>>>,
    events: broadcast::Sender<Event>,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        config: Arc<EngineConfig>,
        events: broadcast::Sender<Event>,
        steps: StepsProvider,
        resolver: Arc<dyn AnswerResolver>,
        record_messages: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            config,
            connections: Mutex::new(HashMap::new()),
            unassigned_externals: Arc::new(Mutex::new(HashMap::new())),
            steps,
            resolver,
            record_messages,
            messages: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `createOffer(peerId, sessionId?, options?)`: starts a fresh session
    /// unless `session_id` names one already owned by this peer.
    pub async fn create_offer(
        self: &Arc<Self>,
        session_id: Option<Uuid>,
        opts: CreateOfferOptions,
    ) -> Result<(Uuid, SessionDescription), MockRtcError> {
        let mock = self.resolve_session(session_id).await?;
        let offer = mock.connection().create_offer(opts).await?;
        Ok((mock.id(), offer))
    }

    /// `answerOffer(peerId, sessionId?, offer, options?)`.
    pub async fn answer_offer(
        self: &Arc<Self>,
        session_id: Option<Uuid>,
        offer: SessionDescription,
        opts: AnswerOfferOptions,
    ) -> Result<(Uuid, SessionDescription), MockRtcError> {
        let mock = self.resolve_session(session_id).await?;
        let answer = mock.connection().answer_offer(offer, opts).await?;
        Ok((mock.id(), answer))
    }

    /// `completeOffer(peerId, sessionId, answer)`.
    pub async fn complete_offer(&self, session_id: Uuid, answer: SessionDescription) -> Result<(), MockRtcError> {
        let mock = self.get_session(session_id).await?;
        mock.connection().complete_offer(answer).await
    }

    /// `createExternalOffer(peerId, options?)`: a bare Connection with no
    /// step runtime, parked in the unassigned-externals map until an
    /// `attach-external` control message claims it.
    pub async fn create_external_offer(
        &self,
        opts: CreateOfferOptions,
    ) -> Result<(Uuid, SessionDescription), MockRtcError> {
        let connection = Arc::new(Connection::new(Arc::clone(&self.config)).await?);
        connection.install_remote_observers().await?;
        let offer = connection.create_offer(opts).await?;
        let id = connection.id();
        self.unassigned_externals.lock().await.insert(id, connection);
        Ok((id, offer))
    }

    /// `answerExternalOffer(peerId, offer, options?)`.
    pub async fn answer_external_offer(
        &self,
        offer: SessionDescription,
        opts: AnswerOfferOptions,
    ) -> Result<(Uuid, SessionDescription), MockRtcError> {
        let connection = Arc::new(Connection::new(Arc::clone(&self.config)).await?);
        connection.install_remote_observers().await?;
        let answer = connection.answer_offer(offer, opts).await?;
        let id = connection.id();
        self.unassigned_externals.lock().await.insert(id, connection);
        Ok((id, answer))
    }

    /// `getSeenMessages(peerId)`.
    pub async fn get_all_messages(&self) -> Result<HashMap<String, Vec<Payload>>, MockRtcError> {
        if !self.record_messages {
            return Err(MockRtcError::RecordingDisabled);
        }
        Ok(self.messages.lock().await.clone())
    }

    /// `getSeenMessages(peerId, channelName)`.
    pub async fn get_messages_on_channel(&self, label: &str) -> Result<Vec<Payload>, MockRtcError> {
        if !self.record_messages {
            return Err(MockRtcError::RecordingDisabled);
        }
        Ok(self.messages.lock().await.get(label).cloned().unwrap_or_default())
    }

    /// Closes every tracked connection in parallel (spec.md section 4.7).
    pub async fn close(&self) -> Result<(), MockRtcError> {
        let mocks: Vec<_> = self.connections.lock().await.values().cloned().collect();
        let externals: Vec<_> = self.unassigned_externals.lock().await.values().cloned().collect();

        let mut tasks = JoinSet::new();
        for mock in mocks {
            tasks.spawn(async move { mock.close().await });
        }
        for external in externals {
            tasks.spawn(async move { external.close().await });
        }
        while let Some(result) = tasks.join_next().await {
            result.map_err(|err| MockRtcError::InvalidState(err.to_string()))??;
        }
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Arc<MockConnection>, MockRtcError> {
        self.connections
            .lock()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| MockRtcError::NotFound(format!("no session {session_id} on peer {}", self.id)))
    }

    async fn resolve_session(self: &Arc<Self>, session_id: Option<Uuid>) -> Result<Arc<MockConnection>, MockRtcError> {
        match session_id {
            Some(id) => self.get_session(id).await,
            None => self.create_session().await,
        }
    }

    async fn create_session(self: &Arc<Self>) -> Result<Arc<MockConnection>, MockRtcError> {
        let connection = Arc::new(Connection::new(Arc::clone(&self.config)).await?);
        connection.install_remote_observers().await?;
        let mock = MockConnection::new(Arc::clone(&connection), Arc::clone(&self.unassigned_externals)).await?;

        self.connections.lock().await.insert(mock.id(), Arc::clone(&mock));
        self.spawn_event_bridge(Arc::clone(&mock));
        self.spawn_step_runtime(Arc::clone(&mock));
        Ok(mock)
    }

    fn spawn_step_runtime(self: &Arc<Self>, mock: Arc<MockConnection>) {
        let this = Arc::clone(self);
        // Subscribed here, synchronously, rather than inside the spawned task
        // below -- a broadcast receiver only sees signals sent after it
        // subscribes, so subscribing late could miss `Connected` firing
        // before the task gets scheduled.
        let mut connection_signals = mock.connection().subscribe();
        tokio::spawn(async move {
            let steps = this.steps.resolve(&mock, &mut connection_signals).await;
            let _ = runtime::run_steps(&steps, &mock, this.resolver.as_ref()).await;
        });
    }

    /// Translate a Connection's internal signals into the public `Event`
    /// taxonomy, stamping `peerId`/`sessionId` on the way out.
    fn spawn_event_bridge(self: &Arc<Self>, mock: Arc<MockConnection>) {
        let this = Arc::clone(self);
        let connection_signals = mock.connection().subscribe();
        let mock_for_connection = Arc::clone(&mock);
        tokio::spawn(async move {
            this.watch_connection_signals(mock_for_connection, connection_signals).await;
        });

        let this = Arc::clone(self);
        let mock_signals = mock.subscribe();
        tokio::spawn(async move {
            this.watch_mock_signals(mock, mock_signals).await;
        });
    }

    async fn watch_connection_signals(
        self: Arc<Self>,
        mock: Arc<MockConnection>,
        mut signals: broadcast::Receiver<ConnectionSignal>,
    ) {
        while let Ok(signal) = signals.recv().await {
            match signal {
                ConnectionSignal::Connected => self.emit_peer_connected(&mock).await,
                ConnectionSignal::Disconnected | ConnectionSignal::Failed => {
                    self.emit_peer_disconnected_once(&mock).await
                }
                ConnectionSignal::ChannelCreated { stream, .. } => {
                    self.spawn_channel_bridge(mock.id(), stream);
                }
                ConnectionSignal::TrackCreated { stream, .. } => {
                    self.spawn_track_bridge(mock.id(), stream);
                }
                ConnectionSignal::ChannelOpen { .. } | ConnectionSignal::TrackOpen { .. } => {}
                ConnectionSignal::Closed => {
                    // `Close`/a completed step list closes the connection
                    // without ever reporting `Disconnected`/`Failed`; a
                    // connection that reached `connected` still owes exactly
                    // one `peer-disconnected` (spec.md section 8).
                    self.emit_peer_disconnected_once(&mock).await;
                    break;
                }
            }
        }
    }

    async fn watch_mock_signals(
        self: Arc<Self>,
        mock: Arc<MockConnection>,
        mut signals: broadcast::Receiver<MockConnectionSignal>,
    ) {
        while let Ok(signal) = signals.recv().await {
            let MockConnectionSignal::ExternalAttached(external) = signal;
            self.emit_external_attached(&mock, &external).await;
        }
    }

    async fn emit_peer_connected(&self, mock: &Arc<MockConnection>) {
        mock.note_connected().await;
        let (local, remote) = mock.selected_candidate_pair().await;
        let event = Event::PeerConnected {
            peer_id: self.id.clone(),
            session_id: mock.id(),
            event_timestamp: now_millis(),
            metadata: mock.metadata().await,
            timing_events: mock.timing_events().await,
            local_session_description: mock.local_description().await.unwrap_or_default_sdp(),
            remote_session_description: mock.remote_description().await.unwrap_or_default_sdp(),
            selected_local_candidate: local,
            selected_remote_candidate: remote,
        };
        let _ = self.events.send(event);
    }

    /// Emits `peer-disconnected` only for a session that actually reached
    /// `connected` and hasn't already been reported disconnected -- so a
    /// `Failed` followed by `Closed`, or a connection that never connected
    /// at all, doesn't produce extra or spurious events.
    async fn emit_peer_disconnected_once(&self, mock: &Arc<MockConnection>) {
        let timing = mock.timing_events().await;
        if timing.connect_timestamp.is_some() && timing.disconnect_timestamp.is_none() {
            self.emit_peer_disconnected(mock).await;
        }
    }

    async fn emit_peer_disconnected(&self, mock: &Arc<MockConnection>) {
        mock.note_disconnected().await;
        let event = Event::PeerDisconnected {
            peer_id: self.id.clone(),
            session_id: mock.id(),
            event_timestamp: now_millis(),
            timing_events: mock.timing_events().await,
        };
        let _ = self.events.send(event);
    }

    async fn emit_external_attached(&self, mock: &Arc<MockConnection>, external: &Arc<Connection>) {
        let (local, remote) = external.selected_candidate_pair().await;
        let event = Event::ExternalPeerAttached {
            peer_id: self.id.clone(),
            session_id: mock.id(),
            event_timestamp: now_millis(),
            timing_events: mock.timing_events().await,
            external_session_id: external.id(),
            external_local_session_description: external.local_description().await,
            external_remote_session_description: external.remote_description().await,
            external_selected_local_candidate: local,
            external_selected_remote_candidate: remote,
        };
        let _ = self.events.send(event);
    }

    fn spawn_channel_bridge(self: &Arc<Self>, session_id: Uuid, channel: Arc<DataChannelStream>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = channel.subscribe();
            while let Ok(event) = events.recv().await {
                match event {
                    ChannelEvent::Open => {
                        let _ = this.events.send(Event::DataChannelOpened {
                            peer_id: this.id.clone(),
                            session_id,
                            event_timestamp: now_millis(),
                            channel_id: channel.id(),
                            channel_label: channel.label().to_string(),
                            channel_protocol: channel.protocol().to_string(),
                        });
                    }
                    ChannelEvent::ReadData(payload) => {
                        this.record_message(channel.label(), &payload).await;
                        this.emit_data_channel_message(session_id, channel.id(), MessageDirection::Received, &payload);
                    }
                    ChannelEvent::WroteData(payload) => {
                        this.emit_data_channel_message(session_id, channel.id(), MessageDirection::Sent, &payload);
                    }
                    ChannelEvent::Close => {
                        let _ = this.events.send(Event::DataChannelClosed {
                            peer_id: this.id.clone(),
                            session_id,
                            event_timestamp: now_millis(),
                            channel_id: channel.id(),
                        });
                        break;
                    }
                    ChannelEvent::Error(_) => {}
                }
            }
        });
    }

    async fn record_message(&self, label: &str, payload: &Payload) {
        if !self.record_messages {
            return;
        }
        self.messages
            .lock()
            .await
            .entry(label.to_string())
            .or_default()
            .push(payload.clone());
    }

    fn emit_data_channel_message(&self, session_id: Uuid, channel_id: u16, direction: MessageDirection, payload: &Payload) {
        let (content, is_binary) = match payload {
            Payload::Text(text) => (EventPayload::Text(text.clone()), false),
            Payload::Binary(bytes) => (EventPayload::Binary(bytes.clone()), true),
        };
        let _ = self.events.send(Event::DataChannelMessage {
            peer_id: self.id.clone(),
            session_id,
            event_timestamp: now_millis(),
            channel_id,
            direction,
            content,
            is_binary,
        });
    }

    fn spawn_track_bridge(self: &Arc<Self>, session_id: Uuid, track: Arc<MediaTrackStream>) {
        let this = Arc::clone(self);
        let stats_interval = std::time::Duration::from_millis(this.config.media_stats_interval_ms);
        tokio::spawn(async move {
            let _ = this.events.send(Event::MediaTrackOpened {
                peer_id: this.id.clone(),
                session_id,
                event_timestamp: now_millis(),
                track_mid: track.mid().to_string(),
                track_type: track.kind(),
                track_direction: track.direction(),
            });

            let (mut last_sent, mut last_received) = (0u64, 0u64);
            let mut ticker = tokio::time::interval(stats_interval);
            let mut events = track.subscribe();
            loop {
                tokio::select! {
                    // `maybe_emit_stats` broadcasts `TrackEvent::Stats` itself when the
                    // counters moved; the event-stream branch below turns that into the
                    // public event, so this branch only needs to track the last-seen values.
                    _ = ticker.tick() => {
                        if let Some((sent, received)) = track.maybe_emit_stats(last_sent, last_received) {
                            last_sent = sent;
                            last_received = received;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(TrackEvent::Stats { sent, received }) => {
                                let _ = this.events.send(Event::MediaTrackStats {
                                    peer_id: this.id.clone(),
                                    session_id,
                                    event_timestamp: now_millis(),
                                    track_mid: track.mid().to_string(),
                                    total_bytes_sent: sent,
                                    total_bytes_received: received,
                                });
                            }
                            Ok(TrackEvent::Close) | Err(_) => {
                                let _ = this.events.send(Event::MediaTrackClosed {
                                    peer_id: this.id.clone(),
                                    session_id,
                                    event_timestamp: now_millis(),
                                    track_mid: track.mid().to_string(),
                                });
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

trait OrDefaultSdp {
    fn unwrap_or_default_sdp(self) -> SessionDescription;
}

impl OrDefaultSdp for Option<SessionDescription> {
    fn unwrap_or_default_sdp(self) -> SessionDescription {
        self.unwrap_or_else(|| SessionDescription::offer(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_provider_fixed_is_stored_as_is() {
        let steps = vec![mockrtc_protocol::StepDefinition::Close];
        let provider = StepsProvider::Fixed(steps.clone());
        match provider {
            StepsProvider::Fixed(stored) => assert_eq!(stored, steps),
            StepsProvider::Matching(_) => panic!("expected Fixed"),
        }
    }
}
