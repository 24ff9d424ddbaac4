//! `MockConnection`: a [`Connection`] plus the MockRTC control channel,
//! external-connection attachment and the bidirectional traffic proxy
//! (spec.md section 4.5). Composition, not inheritance -- `Deref` to the
//! wrapped `Connection` the way a newtype wrapper would, per spec.md
//! section 9's "no inheritance" note.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use mockrtc_protocol::MockRtcError;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::connection::data_channel::{ChannelEvent, DataChannelStream, Payload};
use crate::connection::{Connection, ConnectionSignal};

pub const CONTROL_CHANNEL_LABEL: &str = "mockrtc.control-channel";

/// Connections a Peer has negotiated as bare externals (no step runtime)
/// but not yet attached to a MockConnection, keyed by their own id.
/// Owned and mutated only by the Peer; the control-channel handler below
/// only looks values up by id.
pub type UnassignedExternals = Arc<Mutex<HashMap<Uuid, Arc<Connection>>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ControlMessage {
    AttachExternal { id: Uuid },
    Error { error: String },
}

#[derive(Debug, Clone)]
pub enum MockConnectionSignal {
    ExternalAttached(Arc<Connection>),
}

pub struct MockConnection {
    connection: Arc<Connection>,
    control_channel: Arc<DataChannelStream>,
    external: Mutex<Option<Arc<Connection>>>,
    unassigned_externals: UnassignedExternals,
    signals: broadcast::Sender<MockConnectionSignal>,
}

impl Deref for MockConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl MockConnection {
    pub async fn new(
        connection: Arc<Connection>,
        unassigned_externals: UnassignedExternals,
    ) -> Result<Arc<Self>, MockRtcError> {
        let control_channel = connection.create_data_channel(CONTROL_CHANNEL_LABEL).await?;
        let (signals, _) = broadcast::channel(16);

        let mock = Arc::new(Self {
            connection,
            control_channel,
            external: Mutex::new(None),
            unassigned_externals,
            signals,
        });

        mock.clone().spawn_control_listener();
        Ok(mock)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MockConnectionSignal> {
        self.signals.subscribe()
    }

    /// The wrapped connection as an owned handle, for callers that need
    /// `Arc<Connection>` itself (e.g. to call its `self: &Arc<Self>`
    /// methods) rather than the `&Connection` `Deref` exposes.
    pub fn connection(&self) -> Arc<Connection> {
        Arc::clone(&self.connection)
    }

    pub async fn external(&self) -> Option<Arc<Connection>> {
        self.external.lock().await.clone()
    }

    fn spawn_control_listener(self: Arc<Self>) {
        let mut events = self.control_channel.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let ChannelEvent::ReadData(Payload::Text(text)) = event else {
                    continue;
                };
                self.handle_control_message(&text).await;
            }
        });
    }

    async fn handle_control_message(&self, text: &str) {
        let parsed: Result<ControlMessage, _> = serde_json::from_str(text);
        match parsed {
            Ok(ControlMessage::AttachExternal { id }) => {
                if let Err(err) = self.attach_external(id).await {
                    self.reply_error(&err.to_string()).await;
                }
            }
            Ok(ControlMessage::Error { .. }) => {
                // We never expect to receive our own error replies back;
                // ignore rather than treat as protocol-error.
            }
            Err(err) => {
                self.reply_error(&format!("malformed control message: {err}")).await;
            }
        }
    }

    async fn reply_error(&self, error: &str) {
        let message = ControlMessage::Error {
            error: error.to_string(),
        };
        if let Ok(json) = serde_json::to_string(&message) {
            let _ = self.control_channel.send(Payload::Text(json)).await;
        }
    }

    /// `attach-external` handling, spec.md section 4.5. Duplicate
    /// attachment is fatal on this connection.
    async fn attach_external(&self, id: Uuid) -> Result<(), MockRtcError> {
        if self.external.lock().await.is_some() {
            return Err(MockRtcError::InvalidState(
                "external connection already attached".into(),
            ));
        }

        let external = {
            let mut unassigned = self.unassigned_externals.lock().await;
            unassigned.remove(&id)
        };

        let Some(external) = external else {
            return Err(MockRtcError::NotFound(format!(
                "no unassigned external connection with id {id}"
            )));
        };

        *self.external.lock().await = Some(Arc::clone(&external));
        let _ = self
            .signals
            .send(MockConnectionSignal::ExternalAttached(external));
        Ok(())
    }

    /// Wait for an external to be attached via the control channel, then
    /// bridge traffic to it. Used by the `dynamic-proxy` step.
    pub async fn wait_for_external(self: &Arc<Self>) -> Arc<Connection> {
        if let Some(external) = self.external().await {
            return external;
        }
        let mut signals = self.subscribe();
        loop {
            if let Ok(MockConnectionSignal::ExternalAttached(external)) = signals.recv().await {
                return external;
            }
        }
    }

    /// `proxyTrafficTo(external)`, spec.md section 4.5: bridge every
    /// existing and future local-created-on-external or remote-opened
    /// channel on either side, piping both directions, and propagate close.
    pub async fn proxy_traffic_to(self: &Arc<Self>, external: Arc<Connection>) -> Result<(), MockRtcError> {
        *self.external.lock().await = Some(Arc::clone(&external));

        for channel in external.channels().await {
            if channel.is_local() {
                self.bridge(Arc::clone(&external), channel).await?;
            }
        }
        for channel in self.connection.channels().await {
            if !channel.is_local() {
                self.bridge(Arc::clone(&external), channel).await?;
            }
        }
        for channel in external.channels().await {
            if !channel.is_local() {
                self.bridge(Arc::clone(&external), channel).await?;
            }
        }

        self.watch_future_channels(Arc::clone(&external));
        self.watch_close_propagation(external);
        Ok(())
    }

    /// Open a mirror channel with the same label on the connection that
    /// doesn't already have `source`, then pipe both directions.
    async fn bridge(
        self: &Arc<Self>,
        external: Arc<Connection>,
        source: Arc<DataChannelStream>,
    ) -> Result<(), MockRtcError> {
        let source_is_on_self = self
            .connection
            .channels()
            .await
            .iter()
            .any(|c| Arc::ptr_eq(c, &source));

        let mirror = if source_is_on_self {
            external.create_data_channel(source.label()).await?
        } else {
            self.connection.create_data_channel(source.label()).await?
        };

        pipe(Arc::clone(&source), Arc::clone(&mirror));
        pipe(mirror, source);
        Ok(())
    }

    fn watch_future_channels(self: &Arc<Self>, external: Arc<Connection>) {
        let this = Arc::clone(self);
        let mut own_signals = self.connection.subscribe();
        let ext = Arc::clone(&external);
        tokio::spawn(async move {
            while let Ok(signal) = own_signals.recv().await {
                if let ConnectionSignal::ChannelCreated { stream, is_local } = signal {
                    if !is_local {
                        let _ = this.bridge(Arc::clone(&ext), stream).await;
                    }
                }
            }
        });

        let this = Arc::clone(self);
        let mut ext_signals = external.subscribe();
        tokio::spawn(async move {
            while let Ok(signal) = ext_signals.recv().await {
                if let ConnectionSignal::ChannelCreated { stream, is_local } = signal {
                    // `bridge` creates the mirror half of each pair as a
                    // local-created channel on whichever side didn't have the
                    // source -- skip those here or we'd re-bridge our own
                    // mirror and create a second, spurious one.
                    if !is_local {
                        let _ = this.bridge(Arc::clone(&external), stream).await;
                    }
                }
            }
        });
    }

    fn watch_close_propagation(self: &Arc<Self>, external: Arc<Connection>) {
        let ext = Arc::clone(&external);
        let mut own_signals = self.connection.subscribe();
        tokio::spawn(async move {
            while let Ok(signal) = own_signals.recv().await {
                if matches!(signal, ConnectionSignal::Closed) {
                    let _ = ext.close().await;
                    break;
                }
            }
        });

        let this = Arc::clone(self);
        let mut ext_signals = external.subscribe();
        tokio::spawn(async move {
            while let Ok(signal) = ext_signals.recv().await {
                if matches!(signal, ConnectionSignal::Closed) {
                    let _ = this.connection.close().await;
                    break;
                }
            }
        });
    }
}

/// Forward every inbound message on `from` to a write on `to`.
fn pipe(from: Arc<DataChannelStream>, to: Arc<DataChannelStream>) {
    tokio::spawn(async move {
        let mut events = from.subscribe();
        while let Ok(event) = events.recv().await {
            match event {
                ChannelEvent::ReadData(payload) => {
                    let _ = to.send(payload).await;
                }
                ChannelEvent::Close => break,
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_tag_is_kebab_case() {
        let message = ControlMessage::AttachExternal { id: Uuid::nil() };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"attach-external""#));
    }

    #[test]
    fn error_message_round_trips() {
        let message = ControlMessage::Error {
            error: "broken".to_string(),
        };
        let json = serde_json::to_string(&message).unwrap();
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ControlMessage::Error { error } if error == "broken"));
    }
}
