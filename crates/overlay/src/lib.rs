//! Overlay network boundary.
//!
//! The gossip/DHT overlay is an external collaborator; Agora only assumes
//! capability-matched peer discovery, direct messaging, and an inbound
//! subscription. [`Overlay`] is that seam. [`LocalOverlayNetwork`] is an
//! in-process implementation used by tests and single-process wiring.

mod local;

pub use local::{LocalOverlay, LocalOverlayNetwork};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use tokio::sync::broadcast;

use agora_primitives::{AgentMessage, PeerId};

/// Errors from overlay operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OverlayError {
    /// The peer is not reachable on the overlay.
    #[error("peer {0} is unreachable")]
    PeerUnreachable(PeerId),

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The subscription side is gone.
    #[error("overlay channel closed")]
    ChannelClosed,
}

/// A peer's advertised identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Overlay identity.
    pub peer_id: PeerId,
    /// Wallet payments to this peer go to.
    pub wallet_address: Address,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Stake backing the advertisement, if any.
    pub stake: Option<U256>,
}

impl PeerInfo {
    /// An info block whose wallet equals the peer id address.
    pub fn new(peer_id: PeerId, capabilities: Vec<String>) -> Self {
        Self {
            peer_id,
            wallet_address: peer_id.address(),
            capabilities,
            stake: None,
        }
    }
}

/// A capability match: a peer plus a score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMatch {
    /// The matched peer.
    pub peer: PeerInfo,
    /// How well the peer's capabilities satisfy the query.
    pub match_score: f64,
}

/// A capability query against the overlay's peer index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentQuery {
    /// Required capabilities; empty matches everything.
    pub capabilities: Vec<String>,
}

impl AgentQuery {
    /// Query for the given capabilities.
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

/// A message delivered from the overlay.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The sending peer.
    pub from: PeerId,
    /// The message.
    pub message: AgentMessage,
}

/// The overlay seam: discovery, direct messaging, inbound subscription.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// This node's overlay identity.
    fn local_peer(&self) -> PeerId;

    /// Peers whose advertised capabilities match the query, best first.
    async fn find_agents(&self, query: &AgentQuery) -> Result<Vec<PeerMatch>, OverlayError>;

    /// Send a direct message to one peer.
    async fn send(&self, to: PeerId, message: AgentMessage) -> Result<(), OverlayError>;

    /// Subscribe to messages addressed to this node.
    fn subscribe(&self) -> broadcast::Receiver<InboundMessage>;
}
