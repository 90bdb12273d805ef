//! Core primitive types for the Agora agent network.
//!
//! Everything that crosses a crate boundary lives here: peer identity,
//! wei-denominated amounts, invoices and payment proofs, the durable payment
//! records, and the overlay protocol message sum type.

pub mod invoice;
pub mod message;
pub mod records;
pub mod wei;

pub use invoice::{Invoice, InvoiceError, PaymentProof};
pub use message::AgentMessage;

use std::fmt;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// Identity of a peer on the overlay.
///
/// A peer id is the Ethereum address derived from the peer's secp256k1 key,
/// so invoice signatures can be checked against the declared sender without
/// a separate key registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub Address);

impl PeerId {
    /// Peer id for the given wallet address.
    pub const fn new(address: Address) -> Self {
        Self(address)
    }

    /// The underlying address.
    pub const fn address(&self) -> Address {
        self.0
    }

    /// A random peer id (tests and ephemeral identities).
    pub fn random() -> Self {
        Self(Address::random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Address> for PeerId {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

/// Mint a fresh globally-unique id (invoices, orchestrations, escrows).
pub fn new_id() -> String {
    B256::random().to_string()
}

/// Correlated request id for one peer within one orchestration:
/// `{orchestration}-{peer}`. Responses name both the orchestration and the
/// answering peer.
pub fn request_id(orchestration_id: &str, peer: &PeerId) -> String {
    format!("{orchestration_id}-{peer}")
}

/// Current unix time in milliseconds.
pub fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_roundtrip() {
        let peer = PeerId::random();
        let shown = peer.to_string();
        assert!(shown.starts_with("0x"));
        assert_eq!(shown.len(), 42);
    }

    #[test]
    fn test_new_ids_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn test_request_id_names_both_parties() {
        let peer = PeerId::random();
        let id = request_id("0xabc", &peer);
        assert!(id.starts_with("0xabc-"));
        assert!(id.ends_with(&peer.to_string()));
    }
}
