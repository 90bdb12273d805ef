//! In-process overlay.
//!
//! A registry of nodes in one process, with capability matching over the
//! advertised capability lists and direct delivery through per-node
//! broadcast channels. Used by the scenario tests and single-process wiring;
//! a real deployment plugs a gossip overlay into the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use agora_primitives::{AgentMessage, PeerId};

use crate::{AgentQuery, InboundMessage, Overlay, OverlayError, PeerInfo, PeerMatch};

const CHANNEL_CAPACITY: usize = 256;

struct NodeEntry {
    info: PeerInfo,
    tx: broadcast::Sender<InboundMessage>,
}

/// Registry shared by all in-process overlays.
#[derive(Default)]
pub struct LocalOverlayNetwork {
    nodes: RwLock<HashMap<PeerId, NodeEntry>>,
}

impl LocalOverlayNetwork {
    /// An empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the network with the given advertisement.
    pub fn join(self: &Arc<Self>, info: PeerInfo) -> LocalOverlay {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let peer = info.peer_id;
        self.nodes.write().insert(
            peer,
            NodeEntry {
                info,
                tx: tx.clone(),
            },
        );
        LocalOverlay {
            network: Arc::clone(self),
            peer,
            tx,
        }
    }

    /// Remove a node from the registry.
    pub fn leave(&self, peer: &PeerId) {
        self.nodes.write().remove(peer);
    }

    fn matches(&self, query: &AgentQuery) -> Vec<PeerMatch> {
        let nodes = self.nodes.read();
        let mut out: Vec<PeerMatch> = nodes
            .values()
            .filter_map(|entry| {
                let score = capability_score(query, &entry.info.capabilities);
                (score > 0.0).then(|| PeerMatch {
                    peer: entry.info.clone(),
                    match_score: score,
                })
            })
            .collect();
        // Best score first; peer id breaks ties so the order is stable.
        out.sort_by(|a, b| {
            b.match_score
                .total_cmp(&a.match_score)
                .then_with(|| a.peer.peer_id.cmp(&b.peer.peer_id))
        });
        out
    }
}

/// Fraction of queried capabilities the peer advertises.
fn capability_score(query: &AgentQuery, advertised: &[String]) -> f64 {
    if query.capabilities.is_empty() {
        return 1.0;
    }
    let hits = query
        .capabilities
        .iter()
        .filter(|c| advertised.iter().any(|a| a == *c))
        .count();
    hits as f64 / query.capabilities.len() as f64
}

/// One node's handle onto a [`LocalOverlayNetwork`].
pub struct LocalOverlay {
    network: Arc<LocalOverlayNetwork>,
    peer: PeerId,
    tx: broadcast::Sender<InboundMessage>,
}

#[async_trait]
impl Overlay for LocalOverlay {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    async fn find_agents(&self, query: &AgentQuery) -> Result<Vec<PeerMatch>, OverlayError> {
        Ok(self.network.matches(query))
    }

    async fn send(&self, to: PeerId, message: AgentMessage) -> Result<(), OverlayError> {
        let tx = {
            let nodes = self.network.nodes.read();
            nodes
                .get(&to)
                .map(|entry| entry.tx.clone())
                .ok_or(OverlayError::PeerUnreachable(to))?
        };
        trace!(from = %self.peer, %to, "Local overlay delivery");
        tx.send(InboundMessage {
            from: self.peer,
            message,
        })
        .map_err(|e| OverlayError::Publish(e.to_string()))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_primitives::message::{AgentReply, StreamingTick};

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_capability_matching_scores() {
        let network = LocalOverlayNetwork::new();
        let full = network.join(PeerInfo::new(PeerId::random(), caps(&["code", "math"])));
        let _half = network.join(PeerInfo::new(PeerId::random(), caps(&["code"])));
        let _none = network.join(PeerInfo::new(PeerId::random(), caps(&["poetry"])));

        let matches = full
            .find_agents(&AgentQuery::new(["code", "math"]))
            .await
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].match_score, 1.0);
        assert_eq!(matches[1].match_score, 0.5);
    }

    #[tokio::test]
    async fn test_empty_query_matches_everyone() {
        let network = LocalOverlayNetwork::new();
        let a = network.join(PeerInfo::new(PeerId::random(), caps(&["x"])));
        let _b = network.join(PeerInfo::new(PeerId::random(), caps(&["y"])));

        let matches = a.find_agents(&AgentQuery::default()).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.match_score == 1.0));
    }

    #[tokio::test]
    async fn test_send_delivers_to_subscriber() {
        let network = LocalOverlayNetwork::new();
        let alice = network.join(PeerInfo::new(PeerId::random(), caps(&["a"])));
        let bob = network.join(PeerInfo::new(PeerId::random(), caps(&["b"])));

        let mut inbox = bob.subscribe();
        alice
            .send(
                bob.local_peer(),
                AgentMessage::AgentResponse(AgentReply {
                    request_id: "r1".into(),
                    response: Some("hi".into()),
                    error: None,
                }),
            )
            .await
            .unwrap();

        let delivered = inbox.recv().await.unwrap();
        assert_eq!(delivered.from, alice.local_peer());
        assert_eq!(delivered.message.request_id(), Some("r1"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let network = LocalOverlayNetwork::new();
        let alice = network.join(PeerInfo::new(PeerId::random(), caps(&["a"])));

        let err = alice
            .send(
                PeerId::random(),
                AgentMessage::StreamingTick(StreamingTick {
                    channel_id: None,
                    tokens_generated: 0,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_leave_removes_peer() {
        let network = LocalOverlayNetwork::new();
        let alice = network.join(PeerInfo::new(PeerId::random(), caps(&["a"])));
        let bob = network.join(PeerInfo::new(PeerId::random(), caps(&["a"])));

        network.leave(&bob.local_peer());
        let matches = alice.find_agents(&AgentQuery::new(["a"])).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].peer.peer_id, alice.local_peer());
    }
}
