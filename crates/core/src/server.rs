//! `Server`: the Peer registry, the distinguished `matching-peer`, the rule
//! list, and the event bus (spec.md section 4.8). Grounded on the teacher's
//! top-level `Server` (room registry + broadcast event channel owned at the
//! top and cloned down into every session), generalized to own a rule list
//! instead of a fixed room set.

use std::collections::HashMap;
use std::sync::Arc;

use mockrtc_protocol::{Event, MockRtcError, Rule, StepDefinition};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::peer::{Peer, StepsProvider};
use crate::runtime::AnswerResolver;

/// Reserved peer id for the rule-driven matching peer (spec.md section 3).
pub const MATCHING_PEER_ID: &str = "matching-peer";

pub struct Server {
    config: Arc<EngineConfig>,
    resolver: Arc<dyn AnswerResolver>,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    rules: Arc<Mutex<Vec<Rule>>>,
    events: broadcast::Sender<Event>,
}

impl Server {
    pub fn new(config: Arc<EngineConfig>, resolver: Arc<dyn AnswerResolver>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let rules = Arc::new(Mutex::new(Vec::new()));

        let matching_peer = Peer::new(
            MATCHING_PEER_ID,
            Arc::clone(&config),
            events.clone(),
            StepsProvider::Matching(Arc::clone(&rules)),
            Arc::clone(&resolver),
            config.record_messages_by_default,
        );
        let mut peers = HashMap::new();
        peers.insert(MATCHING_PEER_ID.to_string(), matching_peer);

        Arc::new(Self {
            config,
            resolver,
            peers: Mutex::new(peers),
            rules,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// `createPeer(steps[])`.
    pub async fn create_peer(self: &Arc<Self>, steps: Vec<StepDefinition>) -> Result<String, MockRtcError> {
        mockrtc_protocol::validate_step_list(&steps).map_err(MockRtcError::ProtocolError)?;
        let id = Uuid::new_v4().to_string();
        let peer = Peer::new(
            id.clone(),
            Arc::clone(&self.config),
            self.events.clone(),
            StepsProvider::Fixed(steps),
            Arc::clone(&self.resolver),
            self.config.record_messages_by_default,
        );
        self.peers.lock().await.insert(id.clone(), peer);
        Ok(id)
    }

    pub async fn peer(&self, peer_id: &str) -> Result<Arc<Peer>, MockRtcError> {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| MockRtcError::NotFound(format!("no peer {peer_id}")))
    }

    /// `addRTCRule(matchers[], steps[])`: appends to the matching peer's
    /// rule list, evaluated in insertion order (spec.md section 4.8).
    pub async fn add_rtc_rule(&self, rule: Rule) -> Result<(), MockRtcError> {
        mockrtc_protocol::validate_step_list(&rule.steps).map_err(MockRtcError::ProtocolError)?;
        self.rules.lock().await.push(rule);
        Ok(())
    }

    /// `setRTCRules(rules[])`: replaces the matching peer's rule list wholesale.
    pub async fn set_rtc_rules(&self, rules: Vec<Rule>) -> Result<(), MockRtcError> {
        for rule in &rules {
            mockrtc_protocol::validate_step_list(&rule.steps).map_err(MockRtcError::ProtocolError)?;
        }
        *self.rules.lock().await = rules;
        Ok(())
    }

    /// Closes every peer, clears the rule list, and recreates the matching
    /// peer (spec.md section 4.8).
    pub async fn reset(self: &Arc<Self>) -> Result<(), MockRtcError> {
        let peers: Vec<_> = self.peers.lock().await.drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.close().await?;
        }
        self.rules.lock().await.clear();

        let matching_peer = Peer::new(
            MATCHING_PEER_ID,
            Arc::clone(&self.config),
            self.events.clone(),
            StepsProvider::Matching(Arc::clone(&self.rules)),
            Arc::clone(&self.resolver),
            self.config.record_messages_by_default,
        );
        self.peers.lock().await.insert(MATCHING_PEER_ID.to_string(), matching_peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectResolver;

    #[async_trait::async_trait]
    impl AnswerResolver for RejectResolver {
        async fn resolve(
            &self,
            _token: &mockrtc_protocol::AnswerResolverToken,
            _offer: mockrtc_protocol::SessionDescription,
        ) -> Result<mockrtc_protocol::SessionDescription, MockRtcError> {
            Err(MockRtcError::InvalidState("no resolver configured in this test".into()))
        }
    }

    #[tokio::test]
    async fn matching_peer_exists_immediately_after_construction() {
        let config = Arc::new(EngineConfig::default());
        let server = Server::new(config, Arc::new(RejectResolver));
        assert!(server.peer(MATCHING_PEER_ID).await.is_ok());
    }

    #[tokio::test]
    async fn create_peer_rejects_terminal_step_not_last() {
        let config = Arc::new(EngineConfig::default());
        let server = Server::new(config, Arc::new(RejectResolver));
        let steps = vec![StepDefinition::Echo, StepDefinition::Close];
        assert!(server.create_peer(steps).await.is_err());
    }
}
