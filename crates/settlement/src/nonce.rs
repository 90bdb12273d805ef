//! Per-chain monotonic nonce allocation.
//!
//! Every acquire re-syncs from `getTransactionCount(pending)` once the chain
//! head has moved more than [`NONCE_RESYNC_BLOCKS`] past the last sync, then
//! hands out `current_nonce + pending_count`. Commit advances the base;
//! rollback releases the reservation so the gap is refilled by the next
//! acquire.

use std::sync::Arc;

use alloy_primitives::Address;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{ChainBackend, SettlementResult};

/// Blocks the head may advance before a re-sync is forced.
pub const NONCE_RESYNC_BLOCKS: u64 = 10;

#[derive(Debug, Default)]
struct NonceState {
    current_nonce: u64,
    pending_count: u64,
    last_sync_block: u64,
    synced: bool,
}

/// Strictly monotone, serialised nonce allocation per chain.
#[derive(Default)]
pub struct NonceManager {
    chains: DashMap<u64, Arc<Mutex<NonceState>>>,
}

impl NonceManager {
    /// A manager with no chain state yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, chain_id: u64) -> Arc<Mutex<NonceState>> {
        self.chains.entry(chain_id).or_default().clone()
    }

    /// Reserve the next nonce for `sender` on the backend's chain.
    ///
    /// The reservation must be paired with exactly one [`commit`](Self::commit)
    /// or [`rollback`](Self::rollback).
    pub async fn acquire(
        &self,
        backend: &dyn ChainBackend,
        sender: Address,
    ) -> SettlementResult<u64> {
        let state = self.chain(backend.chain_id());
        let mut state = state.lock().await;

        let block = backend.block_number().await?;
        if !state.synced || block.saturating_sub(state.last_sync_block) > NONCE_RESYNC_BLOCKS {
            state.current_nonce = backend.transaction_count_pending(sender).await?;
            state.last_sync_block = block;
            state.synced = true;
        }

        let nonce = state.current_nonce + state.pending_count;
        state.pending_count += 1;
        Ok(nonce)
    }

    /// The reserved transaction was mined: advance the base nonce.
    pub async fn commit(&self, chain_id: u64) {
        let state = self.chain(chain_id);
        let mut state = state.lock().await;
        state.current_nonce += 1;
        state.pending_count = state.pending_count.saturating_sub(1);
    }

    /// The reserved transaction was not submitted: release the reservation
    /// so the same nonce is handed out again.
    pub async fn rollback(&self, chain_id: u64) {
        let state = self.chain(chain_id);
        let mut state = state.lock().await;
        state.pending_count = state.pending_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockChainBackend;

    fn sender() -> Address {
        Address::repeat_byte(0x01)
    }

    #[tokio::test]
    async fn test_sequential_acquires_are_monotone() {
        let backend = MockChainBackend::new(1);
        let nonces = NonceManager::new();

        let a = nonces.acquire(&backend, sender()).await.unwrap();
        let b = nonces.acquire(&backend, sender()).await.unwrap();
        let c = nonces.acquire(&backend, sender()).await.unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[tokio::test]
    async fn test_commit_advances_base() {
        let backend = MockChainBackend::new(1);
        let nonces = NonceManager::new();

        assert_eq!(nonces.acquire(&backend, sender()).await.unwrap(), 0);
        nonces.commit(1).await;
        assert_eq!(nonces.acquire(&backend, sender()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_refills_gap() {
        let backend = MockChainBackend::new(1);
        let nonces = NonceManager::new();

        assert_eq!(nonces.acquire(&backend, sender()).await.unwrap(), 0);
        nonces.rollback(1).await;
        // Same nonce is handed out again.
        assert_eq!(nonces.acquire(&backend, sender()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resync_follows_chain_count() {
        let backend = MockChainBackend::new(1);
        let nonces = NonceManager::new();

        assert_eq!(nonces.acquire(&backend, sender()).await.unwrap(), 0);
        nonces.commit(1).await;

        // Another wallet process pushed our on-chain count to 5; once the
        // head moves past the resync window we pick that up.
        for _ in 0..5 {
            backend
                .submit_transfer(crate::TransferRequest {
                    from: sender(),
                    to: Address::repeat_byte(0x02),
                    value: alloy_primitives::U256::ZERO,
                    token: None,
                    nonce: 0,
                })
                .await
                .unwrap();
        }
        backend.set_block(NONCE_RESYNC_BLOCKS + 1);

        assert_eq!(nonces.acquire(&backend, sender()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_chains_are_independent() {
        let chain_a = MockChainBackend::new(1);
        let chain_b = MockChainBackend::new(5);
        let nonces = NonceManager::new();

        assert_eq!(nonces.acquire(&chain_a, sender()).await.unwrap(), 0);
        assert_eq!(nonces.acquire(&chain_a, sender()).await.unwrap(), 1);
        assert_eq!(nonces.acquire(&chain_b, sender()).await.unwrap(), 0);
    }
}
