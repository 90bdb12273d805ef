//! Settlement client.
//!
//! Submits transfers for invoices, batches queued invoices per
//! `(recipient, chain, token)` group, and verifies inbound payment proofs
//! against receipts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use metrics::counter;
use tracing::{debug, warn};

use agora_primitives::{Invoice, PaymentProof, wei};

use crate::{
    ChainBackend, NonceManager, SettlementError, SettlementResult, TransferRequest,
};

/// Settlement tuning knobs.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Delay between receipt polls.
    pub receipt_poll_interval: Duration,
    /// Polls before giving up on a submitted transaction.
    pub receipt_poll_attempts: u32,
    /// Sanity ceiling on a single transfer, in wei (10^15 ether).
    pub max_amount_wei: U256,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            receipt_poll_interval: Duration::from_millis(500),
            receipt_poll_attempts: 20,
            max_amount_wei: U256::from(10u64).pow(U256::from(33u64)),
        }
    }
}

/// Outcome of settling one `(recipient, chain, token)` group.
#[derive(Debug)]
pub struct BatchResult {
    /// Group recipient.
    pub recipient: Address,
    /// Group chain.
    pub chain_id: u64,
    /// Group token symbol.
    pub token: String,
    /// Summed amount, 18-decimal string.
    pub amount: String,
    /// The invoices folded into this group.
    pub invoice_ids: Vec<String>,
    /// Proof on success, error otherwise.
    pub outcome: SettlementResult<PaymentProof>,
}

/// Submits and verifies on-chain transfers across configured chains.
pub struct SettlementClient {
    sender: Address,
    backends: HashMap<u64, Arc<dyn ChainBackend>>,
    nonces: NonceManager,
    config: SettlementConfig,
}

impl SettlementClient {
    /// A client paying from `sender`.
    pub fn new(sender: Address, config: SettlementConfig) -> Self {
        Self {
            sender,
            backends: HashMap::new(),
            nonces: NonceManager::new(),
            config,
        }
    }

    /// Register the backend for one chain.
    pub fn with_backend(mut self, backend: Arc<dyn ChainBackend>) -> Self {
        self.backends.insert(backend.chain_id(), backend);
        self
    }

    /// The paying wallet.
    pub fn sender(&self) -> Address {
        self.sender
    }

    fn backend(&self, chain_id: u64) -> SettlementResult<&Arc<dyn ChainBackend>> {
        self.backends
            .get(&chain_id)
            .ok_or(SettlementError::UnknownChain(chain_id))
    }

    /// Pay one invoice; returns the proof once the transfer is mined.
    ///
    /// The nonce reservation is committed only after a successful receipt;
    /// every failure path rolls it back so the nonce is reused.
    pub async fn pay(&self, invoice: &Invoice) -> SettlementResult<PaymentProof> {
        let backend = self.backend(invoice.chain_id)?;

        let amount = wei::to_wei_positive(&invoice.amount)?;
        if amount > self.config.max_amount_wei {
            return Err(SettlementError::AmountTooLarge {
                amount: invoice.amount.clone(),
            });
        }
        if invoice.recipient == Address::ZERO {
            return Err(SettlementError::ZeroRecipient);
        }

        let balance = backend.balance(self.sender).await?;
        if balance < amount {
            return Err(SettlementError::InsufficientBalance {
                balance,
                required: amount,
            });
        }

        let nonce = self.nonces.acquire(backend.as_ref(), self.sender).await?;

        let submitted = backend
            .submit_transfer(TransferRequest {
                from: self.sender,
                to: invoice.recipient,
                value: amount,
                token: invoice.token_address,
                nonce,
            })
            .await;
        let tx_hash = match submitted {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                self.nonces.rollback(invoice.chain_id).await;
                counter!("agora_settlement_failures_total").increment(1);
                return Err(e);
            }
        };

        debug!(%tx_hash, invoice = %invoice.id, nonce, "Submitted settlement transfer");

        let receipt = self.await_receipt(backend.as_ref(), tx_hash).await;
        match receipt {
            Ok(receipt) if receipt.status => {
                self.nonces.commit(invoice.chain_id).await;
                counter!("agora_settlements_total").increment(1);
                Ok(PaymentProof {
                    invoice_id: invoice.id.clone(),
                    tx_hash,
                    chain_id: invoice.chain_id,
                })
            }
            Ok(_) => {
                self.nonces.rollback(invoice.chain_id).await;
                counter!("agora_settlement_failures_total").increment(1);
                Err(SettlementError::TransactionFailed { tx_hash })
            }
            Err(e) => {
                self.nonces.rollback(invoice.chain_id).await;
                counter!("agora_settlement_failures_total").increment(1);
                Err(e)
            }
        }
    }

    async fn await_receipt(
        &self,
        backend: &dyn ChainBackend,
        tx_hash: alloy_primitives::B256,
    ) -> SettlementResult<crate::TxReceipt> {
        for _ in 0..self.config.receipt_poll_attempts {
            if let Some(receipt) = backend.receipt(tx_hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
        Err(SettlementError::ReceiptTimeout { tx_hash })
    }

    /// Settle a batch of invoices, one transfer per
    /// `(recipient, chain, token)` group with summed amounts.
    pub async fn batch_settle(&self, invoices: &[Invoice]) -> Vec<BatchResult> {
        let mut groups: BTreeMap<(Address, u64, String), Vec<&Invoice>> = BTreeMap::new();
        for invoice in invoices {
            groups
                .entry((invoice.recipient, invoice.chain_id, invoice.token.clone()))
                .or_default()
                .push(invoice);
        }

        let mut results = Vec::with_capacity(groups.len());
        for ((recipient, chain_id, token), group) in groups {
            let invoice_ids: Vec<String> = group.iter().map(|i| i.id.clone()).collect();

            let (amount, outcome) = match wei::sum_wei(group.iter().map(|i| i.amount.as_str())) {
                Ok(total) => {
                    let amount = wei::from_wei(total);
                    let combined = Invoice::new(
                        format!("batch-{chain_id}-{recipient}"),
                        chain_id,
                        token.clone(),
                        group.first().and_then(|i| i.token_address),
                        amount.clone(),
                        recipient,
                        60_000,
                    );
                    let outcome = self.pay(&combined).await;
                    if let Err(e) = &outcome {
                        warn!(%recipient, chain_id, error = %e, "Batch group settlement failed");
                    }
                    (amount, outcome)
                }
                Err(e) => ("0".into(), Err(SettlementError::InvalidAmount(e))),
            };
            results.push(BatchResult {
                recipient,
                chain_id,
                token,
                amount,
                invoice_ids,
                outcome,
            });
        }
        results
    }

    /// Verify a payment proof against the invoice it claims to settle.
    ///
    /// Returns `Ok(false)` on any mismatch; errors surface only backend
    /// failures.
    pub async fn verify_payment(
        &self,
        proof: &PaymentProof,
        invoice: &Invoice,
    ) -> SettlementResult<bool> {
        if proof.chain_id != invoice.chain_id {
            return Ok(false);
        }
        let backend = self.backend(proof.chain_id)?;
        let expected = match invoice.amount_wei() {
            Ok(amount) => amount,
            Err(_) => return Ok(false),
        };

        let Some(receipt) = backend.receipt(proof.tx_hash).await? else {
            return Ok(false);
        };
        if !receipt.status {
            return Ok(false);
        }

        match invoice.token_address {
            // ERC-20: some log must be Transfer(_, recipient, expected)
            // emitted by the token contract.
            Some(token) => Ok(receipt
                .logs
                .iter()
                .any(|log| log.is_transfer_to(token, invoice.recipient, expected))),
            // Native: the transaction itself carries the value.
            None => {
                if receipt.to != Some(invoice.recipient) {
                    return Ok(false);
                }
                let Some(tx) = backend.transaction(proof.tx_hash).await? else {
                    return Ok(false);
                };
                Ok(tx.value >= expected)
            }
        }
    }
}
