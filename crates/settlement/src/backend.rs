//! Chain backend boundary.
//!
//! The EVM client is an external collaborator; this trait is the seam. One
//! backend per chain id. The [`mock`] module provides an in-process backend
//! for tests and local wiring.

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::{SolEvent, sol};
use async_trait::async_trait;

use crate::SettlementResult;

sol! {
    /// ERC-20 transfer event, matched during receipt verification.
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// A transfer to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Sending wallet.
    pub from: Address,
    /// Receiving wallet.
    pub to: Address,
    /// Amount in wei.
    pub value: U256,
    /// ERC-20 contract to transfer through, `None` for native.
    pub token: Option<Address>,
    /// Transaction nonce (allocated by the nonce manager).
    pub nonce: u64,
}

/// One log emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics; `topics[0]` is the event signature.
    pub topics: Vec<B256>,
    /// ABI-encoded unindexed data.
    pub data: Bytes,
}

impl LogEntry {
    /// Whether this log is a `Transfer(_, to, value)` from `token`.
    pub fn is_transfer_to(&self, token: Address, to: Address, value: U256) -> bool {
        self.address == token
            && self.topics.len() == 3
            && self.topics.first() == Some(&Transfer::SIGNATURE_HASH)
            && self.topics.get(2).map(|t| Address::from_word(*t)) == Some(to)
            && U256::from_be_slice(&self.data) == value
    }
}

/// A mined transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    /// Transaction hash.
    pub tx_hash: B256,
    /// True when the transaction succeeded.
    pub status: bool,
    /// Sender.
    pub from: Address,
    /// Receiver (`None` for contract creation).
    pub to: Option<Address>,
    /// Block the transaction landed in.
    pub block_number: u64,
    /// Emitted logs.
    pub logs: Vec<LogEntry>,
}

/// The subset of transaction data verification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    /// Transaction hash.
    pub tx_hash: B256,
    /// Sender.
    pub from: Address,
    /// Receiver.
    pub to: Option<Address>,
    /// Native value transferred.
    pub value: U256,
}

/// Read/submit access to one EVM chain.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// The chain this backend talks to.
    fn chain_id(&self) -> u64;

    /// Native balance of `address`.
    async fn balance(&self, address: Address) -> SettlementResult<U256>;

    /// Transaction count including pending transactions.
    async fn transaction_count_pending(&self, address: Address) -> SettlementResult<u64>;

    /// Latest block number.
    async fn block_number(&self) -> SettlementResult<u64>;

    /// Submit a transfer; returns the transaction hash.
    async fn submit_transfer(&self, request: TransferRequest) -> SettlementResult<B256>;

    /// Receipt for a transaction, `None` while unmined.
    async fn receipt(&self, tx_hash: B256) -> SettlementResult<Option<TxReceipt>>;

    /// Transaction data, `None` when unknown.
    async fn transaction(&self, tx_hash: B256) -> SettlementResult<Option<TxInfo>>;
}

pub mod mock {
    //! In-process chain backend for tests and local wiring.

    use std::collections::HashMap;

    use alloy_primitives::{Address, B256, Bytes, U256};
    use alloy_sol_types::SolEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{ChainBackend, LogEntry, Transfer, TransferRequest, TxInfo, TxReceipt};
    use crate::{SettlementError, SettlementResult};

    #[derive(Default)]
    struct MockState {
        balances: HashMap<Address, U256>,
        tx_counts: HashMap<Address, u64>,
        block: u64,
        receipts: HashMap<B256, TxReceipt>,
        transactions: HashMap<B256, TxInfo>,
        submitted_nonces: Vec<u64>,
        fail_next_submit: bool,
        revert_next: bool,
    }

    /// A backend that mines every submitted transfer instantly.
    pub struct MockChainBackend {
        chain_id: u64,
        state: Mutex<MockState>,
    }

    impl MockChainBackend {
        /// A fresh chain with nothing on it.
        pub fn new(chain_id: u64) -> Self {
            Self {
                chain_id,
                state: Mutex::new(MockState::default()),
            }
        }

        /// Credit `address` with `amount` wei.
        pub fn fund(&self, address: Address, amount: U256) {
            let mut state = self.state.lock();
            let balance = state.balances.entry(address).or_default();
            *balance += amount;
        }

        /// Advance the chain head.
        pub fn set_block(&self, block: u64) {
            self.state.lock().block = block;
        }

        /// Make the next submission fail at the transport level.
        pub fn fail_next_submit(&self) {
            self.state.lock().fail_next_submit = true;
        }

        /// Make the next submitted transaction revert.
        pub fn revert_next(&self) {
            self.state.lock().revert_next = true;
        }

        /// Nonces of every submitted transaction, in submission order.
        pub fn submitted_nonces(&self) -> Vec<u64> {
            self.state.lock().submitted_nonces.clone()
        }
    }

    #[async_trait]
    impl ChainBackend for MockChainBackend {
        fn chain_id(&self) -> u64 {
            self.chain_id
        }

        async fn balance(&self, address: Address) -> SettlementResult<U256> {
            Ok(self
                .state
                .lock()
                .balances
                .get(&address)
                .copied()
                .unwrap_or_default())
        }

        async fn transaction_count_pending(&self, address: Address) -> SettlementResult<u64> {
            Ok(self
                .state
                .lock()
                .tx_counts
                .get(&address)
                .copied()
                .unwrap_or_default())
        }

        async fn block_number(&self) -> SettlementResult<u64> {
            Ok(self.state.lock().block)
        }

        async fn submit_transfer(&self, request: TransferRequest) -> SettlementResult<B256> {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.fail_next_submit) {
                return Err(SettlementError::SubmitFailed("injected failure".into()));
            }

            let reverted = std::mem::take(&mut state.revert_next);
            let tx_hash = B256::random();
            let block = state.block;

            if !reverted {
                let from_balance = state.balances.entry(request.from).or_default();
                *from_balance = from_balance.saturating_sub(request.value);
                let to_balance = state.balances.entry(request.to).or_default();
                *to_balance += request.value;
            }

            let logs = match request.token {
                Some(token) if !reverted => vec![LogEntry {
                    address: token,
                    topics: vec![
                        Transfer::SIGNATURE_HASH,
                        request.from.into_word(),
                        request.to.into_word(),
                    ],
                    data: Bytes::from(request.value.to_be_bytes::<32>().to_vec()),
                }],
                _ => Vec::new(),
            };

            // An ERC-20 transfer goes to the token contract; a native
            // transfer goes straight to the recipient.
            let tx_to = request.token.unwrap_or(request.to);
            let native_value = if request.token.is_some() {
                U256::ZERO
            } else {
                request.value
            };

            state.receipts.insert(
                tx_hash,
                TxReceipt {
                    tx_hash,
                    status: !reverted,
                    from: request.from,
                    to: Some(tx_to),
                    block_number: block,
                    logs,
                },
            );
            state.transactions.insert(
                tx_hash,
                TxInfo {
                    tx_hash,
                    from: request.from,
                    to: Some(tx_to),
                    value: native_value,
                },
            );
            state.submitted_nonces.push(request.nonce);
            *state.tx_counts.entry(request.from).or_default() += 1;
            Ok(tx_hash)
        }

        async fn receipt(&self, tx_hash: B256) -> SettlementResult<Option<TxReceipt>> {
            Ok(self.state.lock().receipts.get(&tx_hash).cloned())
        }

        async fn transaction(&self, tx_hash: B256) -> SettlementResult<Option<TxInfo>> {
            Ok(self.state.lock().transactions.get(&tx_hash).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_log_matching() {
        let token = Address::repeat_byte(0x10);
        let to = Address::repeat_byte(0x02);
        let value = U256::from(1000u64);

        let log = LogEntry {
            address: token,
            topics: vec![
                Transfer::SIGNATURE_HASH,
                Address::repeat_byte(0x01).into_word(),
                to.into_word(),
            ],
            data: Bytes::from(value.to_be_bytes::<32>().to_vec()),
        };

        assert!(log.is_transfer_to(token, to, value));
        // Wrong emitter, recipient, or value must not match.
        assert!(!log.is_transfer_to(Address::repeat_byte(0x11), to, value));
        assert!(!log.is_transfer_to(token, Address::repeat_byte(0x03), value));
        assert!(!log.is_transfer_to(token, to, U256::from(999u64)));
    }

    #[tokio::test]
    async fn test_mock_backend_mines_transfers() {
        use mock::MockChainBackend;

        let backend = MockChainBackend::new(1);
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);
        backend.fund(from, U256::from(1000u64));

        let tx_hash = backend
            .submit_transfer(TransferRequest {
                from,
                to,
                value: U256::from(400u64),
                token: None,
                nonce: 0,
            })
            .await
            .unwrap();

        let receipt = backend.receipt(tx_hash).await.unwrap().unwrap();
        assert!(receipt.status);
        assert_eq!(receipt.to, Some(to));

        assert_eq!(backend.balance(from).await.unwrap(), U256::from(600u64));
        assert_eq!(backend.balance(to).await.unwrap(), U256::from(400u64));
        assert_eq!(backend.transaction_count_pending(from).await.unwrap(), 1);
    }
}
