//! The step interpreter, spec.md section 4.6: turns a `StepDefinition` list
//! into a running sequence of suspension points against a live
//! [`MockConnection`]. Grounded on the teacher's session loop
//! (`Session::run`/`handle_message` driving one action at a time off an
//! event channel), generalized from a fixed handshake sequence to an
//! arbitrary operator-supplied step list.

pub mod matchers;

use std::sync::Arc;

use async_trait::async_trait;
use mockrtc_protocol::{
    AnswerResolverToken, MessageData, MockRtcError, SessionDescription,
};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::connection::data_channel::{ChannelEvent, DataChannelStream, Payload};
use crate::connection::media_track::{MediaTrackStream, TrackEvent};
use crate::connection::{Connection, ConnectionSignal, CreateOfferOptions};
use crate::mock_connection::MockConnection;

/// Resolves the out-of-band answer a `peer-proxy` step needs once it has
/// mirrored the remote SDP onto a fresh external connection. The RPC layer
/// that owns the actual request/response round-trip implements this; this
/// crate only calls it.
#[async_trait]
pub trait AnswerResolver: Send + Sync {
    async fn resolve(
        &self,
        token: &AnswerResolverToken,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MockRtcError>;
}

/// Run a validated step list to completion, then close the connection.
/// Terminal steps (the last entry, if any) only return once the connection
/// closes, so for a list ending in one this call doesn't return until then.
/// A step handler error force-closes the connection before propagating
/// (spec.md section 7: "errors from step handlers propagate up, the
/// connection is force-closed, and the step sequence ends").
pub async fn run_steps(
    steps: &[mockrtc_protocol::StepDefinition],
    mock: &Arc<MockConnection>,
    resolver: &dyn AnswerResolver,
) -> Result<(), MockRtcError> {
    mockrtc_protocol::validate_step_list(steps).map_err(MockRtcError::ProtocolError)?;

    for step in steps {
        if let Err(err) = run_step(step, mock, resolver).await {
            let _ = mock.close().await;
            return Err(err);
        }
    }

    mock.close().await
}

fn transport_failure(mock: &MockConnection, reason: &str) -> MockRtcError {
    MockRtcError::TransportFailure {
        session_id: mock.id(),
        reason: reason.to_string(),
    }
}

async fn run_step(
    step: &mockrtc_protocol::StepDefinition,
    mock: &Arc<MockConnection>,
    resolver: &dyn AnswerResolver,
) -> Result<(), MockRtcError> {
    use mockrtc_protocol::StepDefinition::*;

    match step {
        WaitForDuration { duration_ms } => {
            tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
            Ok(())
        }
        WaitForChannel { channel_label } => wait_for_channel(mock, channel_label.as_deref()).await,
        WaitForMessage { channel_label } => {
            wait_for_message(mock, channel_label.as_deref()).await.map(|_| ())
        }
        WaitForTrack => wait_for_track(mock).await,
        WaitForMedia => wait_for_media(mock).await,
        CreateChannel { channel_label } => {
            mock.connection().create_data_channel(channel_label).await?;
            Ok(())
        }
        Send { channel_label, message } => send(mock, channel_label.as_deref(), message).await,
        Close => mock.close().await,
        Echo => echo(mock).await,
        PeerProxy { answer_resolver } => peer_proxy(mock, answer_resolver, resolver).await,
        DynamicProxy => dynamic_proxy(mock).await,
    }
}

fn label_matches(label: Option<&str>, actual: &str) -> bool {
    label.map(|wanted| wanted == actual).unwrap_or(true)
}

/// `wait-for-channel`: resolves immediately if a matching remote-opened
/// channel already exists, otherwise on the next one to open.
async fn wait_for_channel(mock: &Arc<MockConnection>, label: Option<&str>) -> Result<(), MockRtcError> {
    for channel in mock.channels().await {
        if !channel.is_local() && channel.is_open() && label_matches(label, channel.label()) {
            return Ok(());
        }
    }

    let mut signals = mock.connection().subscribe();
    loop {
        match signals.recv().await {
            Ok(ConnectionSignal::ChannelOpen { stream, is_local: false })
                if label_matches(label, stream.label()) =>
            {
                return Ok(());
            }
            Ok(ConnectionSignal::Failed) => {
                return Err(transport_failure(mock, "ice/dtls/sctp failed while waiting for channel"))
            }
            Ok(_) => continue,
            Err(_) => {
                return Err(MockRtcError::InvalidState(
                    "connection closed while waiting for channel".into(),
                ))
            }
        }
    }
}

/// `wait-for-message`: checks every matching channel's already-buffered
/// queue first, then attaches one one-shot listener per matching channel
/// and resolves on whichever delivers first. A channel that doesn't win the
/// race keeps its own messages queued for the next `wait-for-message`.
async fn wait_for_message(mock: &Arc<MockConnection>, label: Option<&str>) -> Result<Payload, MockRtcError> {
    let channels: Vec<_> = mock
        .channels()
        .await
        .into_iter()
        .filter(|channel| label_matches(label, channel.label()))
        .collect();

    for channel in &channels {
        if let Some(payload) = channel.pop_queued().await {
            return Ok(payload);
        }
    }

    let (tx, mut rx) = mpsc::channel(1);
    for channel in channels {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut events = channel.subscribe();
            while let Ok(event) = events.recv().await {
                if let ChannelEvent::ReadData(payload) = event {
                    let _ = tx.try_send(payload);
                    break;
                }
            }
        });
    }
    drop(tx);

    rx.recv()
        .await
        .ok_or_else(|| MockRtcError::InvalidState("connection closed while waiting for message".into()))
}

/// `wait-for-track`: resolves once any media m-section, local or remote, has
/// been negotiated.
async fn wait_for_track(mock: &Arc<MockConnection>) -> Result<(), MockRtcError> {
    if !mock.tracks().await.is_empty() {
        return Ok(());
    }
    let mut signals = mock.connection().subscribe();
    loop {
        match signals.recv().await {
            Ok(ConnectionSignal::TrackCreated { .. }) => return Ok(()),
            Ok(ConnectionSignal::Failed) => {
                return Err(transport_failure(mock, "ice/dtls/sctp failed while waiting for track"))
            }
            Ok(_) => continue,
            Err(_) => {
                return Err(MockRtcError::InvalidState(
                    "connection closed while waiting for track".into(),
                ))
            }
        }
    }
}

/// `wait-for-media`: resolves on the next inbound RTP packet on any
/// currently-negotiated track, waiting for one to be negotiated first if
/// none exist yet.
async fn wait_for_media(mock: &Arc<MockConnection>) -> Result<(), MockRtcError> {
    let tracks = mock.tracks().await;
    if tracks.is_empty() {
        wait_for_track(mock).await?;
        return Box::pin(wait_for_media(mock)).await;
    }

    let (tx, mut rx) = mpsc::channel(1);
    for track in tracks {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut events = track.subscribe();
            while let Ok(event) = events.recv().await {
                if let TrackEvent::Packet(_) = event {
                    let _ = tx.try_send(());
                    break;
                }
            }
        });
    }
    drop(tx);

    rx.recv()
        .await
        .ok_or_else(|| MockRtcError::InvalidState("connection closed while waiting for media".into()))
}

/// `send`: writes to every open channel matching `label` (or every open
/// channel, with no label). Zero matches is a silent no-op (spec.md
/// section 4.6).
async fn send(mock: &Arc<MockConnection>, label: Option<&str>, message: &MessageData) -> Result<(), MockRtcError> {
    let payload = match message {
        MessageData::Text(text) => Payload::Text(text.clone()),
        MessageData::Binary(bytes) => Payload::Binary(bytes.clone()),
    };

    for channel in mock.channels().await {
        if channel.is_open() && label_matches(label, channel.label()) {
            channel.send(payload.clone()).await?;
        }
    }
    Ok(())
}

/// `echo`, terminal: pipes every channel and track -- present now or created
/// later -- back into itself until the connection closes.
async fn echo(mock: &Arc<MockConnection>) -> Result<(), MockRtcError> {
    for channel in mock.channels().await {
        spawn_echo_channel(channel);
    }
    for track in mock.tracks().await {
        spawn_echo_track(track);
    }

    let mut signals = mock.connection().subscribe();
    loop {
        match signals.recv().await {
            Ok(ConnectionSignal::ChannelCreated { stream, .. }) => spawn_echo_channel(stream),
            Ok(ConnectionSignal::TrackCreated { stream, .. }) => spawn_echo_track(stream),
            Ok(ConnectionSignal::Closed) => return Ok(()),
            Ok(ConnectionSignal::Failed) => {
                return Err(transport_failure(mock, "ice/dtls/sctp failed during echo"))
            }
            Ok(_) => continue,
            Err(_) => return Ok(()),
        }
    }
}

fn spawn_echo_channel(channel: Arc<DataChannelStream>) {
    tokio::spawn(async move {
        let mut events = channel.subscribe();
        while let Ok(event) = events.recv().await {
            match event {
                ChannelEvent::ReadData(payload) => {
                    let _ = channel.send(payload).await;
                }
                ChannelEvent::Close => break,
                _ => {}
            }
        }
    });
}

fn spawn_echo_track(track: Arc<MediaTrackStream>) {
    tokio::spawn(async move {
        let mut events = track.subscribe();
        while let Ok(event) = events.recv().await {
            match event {
                TrackEvent::Packet(packet) => {
                    let _ = track.write(&packet).await;
                }
                TrackEvent::Close => break,
                _ => {}
            }
        }
    });
}

/// `peer-proxy`, terminal: mirrors the connection's negotiated remote SDP
/// onto a fresh external connection, asks the resolver for an answer, then
/// bridges traffic both ways until close.
async fn peer_proxy(
    mock: &Arc<MockConnection>,
    token: &AnswerResolverToken,
    resolver: &dyn AnswerResolver,
) -> Result<(), MockRtcError> {
    let remote = mock.remote_description().await.ok_or_else(|| {
        MockRtcError::InvalidState("no remote description to mirror for peer-proxy".into())
    })?;

    let external = Arc::new(Connection::new(mock.config()).await?);
    external.install_remote_observers().await?;

    let offer = external
        .create_offer(CreateOfferOptions {
            mirror_sdp: Some(remote.parsed()),
            add_data_stream: false,
            connection_metadata: Default::default(),
        })
        .await?;

    let answer = resolver.resolve(token, offer).await?;
    external.complete_offer(answer).await?;

    mock.proxy_traffic_to(external).await?;
    wait_for_close(mock).await
}

/// `dynamic-proxy`, terminal: waits for an external connection to be
/// attached over the control channel, then bridges traffic to it.
async fn dynamic_proxy(mock: &Arc<MockConnection>) -> Result<(), MockRtcError> {
    let external = mock.wait_for_external().await;
    mock.proxy_traffic_to(external).await?;
    wait_for_close(mock).await
}

async fn wait_for_close(mock: &Arc<MockConnection>) -> Result<(), MockRtcError> {
    let mut signals = mock.connection().subscribe();
    loop {
        match signals.recv().await {
            Ok(ConnectionSignal::Closed) => return Ok(()),
            Ok(ConnectionSignal::Failed) => {
                return Err(transport_failure(mock, "ice/dtls/sctp failed while proxying"))
            }
            Ok(_) => continue,
            Err(_) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_matches_none_accepts_anything() {
        assert!(label_matches(None, "whatever"));
        assert!(label_matches(Some("a"), "a"));
        assert!(!label_matches(Some("a"), "b"));
    }
}
