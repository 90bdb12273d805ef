//! Invoices and payment proofs.
//!
//! An invoice is a claim of an amount owed to a recipient on a specific
//! chain. Invoices travel over the overlay as JSON and may carry a secp256k1
//! signature over their canonical form.
//!
//! # Canonical JSON
//!
//! The signing preimage is the JSON serialization of the invoice with
//! `signature` and `publicKey` removed, keys sorted lexicographically and no
//! whitespace. The signature is made over `keccak256` of that byte string,
//! so any party can recover the signer and compare it against the declared
//! sender's peer id.

use alloy_primitives::{Address, B256, Bytes, Signature, keccak256};
use serde::{Deserialize, Serialize};

use crate::{PeerId, new_id, unix_ms, wei};

/// Errors from invoice validation and signature handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvoiceError {
    /// Amount failed to parse as a wei decimal string.
    #[error("invalid invoice amount: {0}")]
    Amount(#[from] wei::WeiError),

    /// `valid_until` does not lie after `created_at`.
    #[error("invoice validity window is empty (valid_until {valid_until} <= created_at {created_at})")]
    InvalidValidity {
        /// Expiry, unix-ms.
        valid_until: u64,
        /// Creation time, unix-ms.
        created_at: u64,
    },

    /// A required field is empty.
    #[error("invoice field {0:?} is empty")]
    MissingField(&'static str),

    /// The invoice carries no signature.
    #[error("invoice is not signed")]
    NotSigned,

    /// Signature bytes could not be parsed or recovered.
    #[error("signature recovery failed: {0}")]
    SignatureRecovery(String),

    /// The declared public key is malformed.
    #[error("invalid public key: {0}")]
    BadPublicKey(String),

    /// The recovered signer does not match the declared sender.
    #[error("invalid signer: expected {expected}, got {actual}")]
    InvalidSigner {
        /// Address the signature was expected to recover to.
        expected: Address,
        /// Address it actually recovered to.
        actual: Address,
    },

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A claim of an amount owed to `recipient` on `chain_id`.
///
/// Authoritative once written to the ledger. `token_address` is `None` for
/// the chain's native token and the ERC-20 contract address otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Unique invoice id.
    pub id: String,
    /// The job this invoice settles.
    pub job_id: String,
    /// EVM chain id.
    pub chain_id: u64,
    /// Token symbol, e.g. `"ETH"`.
    pub token: String,
    /// ERC-20 contract address, `None` for the native token.
    pub token_address: Option<Address>,
    /// Amount as an 18-decimal string.
    pub amount: String,
    /// Wallet to pay.
    pub recipient: Address,
    /// Expiry, unix-ms.
    pub valid_until: u64,
    /// Creation time, unix-ms.
    pub created_at: u64,
    /// 65-byte ECDSA signature over the canonical JSON, if signed.
    pub signature: Option<Bytes>,
    /// Uncompressed SEC1 public key of the signer, if signed.
    pub public_key: Option<Bytes>,
}

impl Invoice {
    /// Create an unsigned invoice valid for `validity_ms` from now.
    pub fn new(
        job_id: impl Into<String>,
        chain_id: u64,
        token: impl Into<String>,
        token_address: Option<Address>,
        amount: impl Into<String>,
        recipient: Address,
        validity_ms: u64,
    ) -> Self {
        let created_at = unix_ms();
        Self {
            id: new_id(),
            job_id: job_id.into(),
            chain_id,
            token: token.into(),
            token_address,
            amount: amount.into(),
            recipient,
            valid_until: created_at + validity_ms,
            created_at,
            signature: None,
            public_key: None,
        }
    }

    /// Check structural invariants: parseable amount, non-empty ids, a
    /// non-empty validity window.
    pub fn validate(&self) -> Result<(), InvoiceError> {
        if self.id.is_empty() {
            return Err(InvoiceError::MissingField("id"));
        }
        if self.job_id.is_empty() {
            return Err(InvoiceError::MissingField("jobId"));
        }
        wei::to_wei(&self.amount)?;
        if self.valid_until <= self.created_at {
            return Err(InvoiceError::InvalidValidity {
                valid_until: self.valid_until,
                created_at: self.created_at,
            });
        }
        Ok(())
    }

    /// The amount in wei.
    pub fn amount_wei(&self) -> Result<alloy_primitives::U256, wei::WeiError> {
        wei::to_wei(&self.amount)
    }

    /// Whether the invoice has expired at `now` (unix-ms).
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.valid_until
    }

    /// Whether a signature is attached.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Canonical signing form: JSON with `signature`/`publicKey` removed.
    ///
    /// Relies on serde_json's sorted map keys; the `preserve_order` feature
    /// must stay off.
    pub fn canonical_json(&self) -> Result<Vec<u8>, InvoiceError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| InvoiceError::Serialization(e.to_string()))?;
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("signature");
            map.remove("publicKey");
        }
        serde_json::to_vec(&value).map_err(|e| InvoiceError::Serialization(e.to_string()))
    }

    /// The keccak256 prehash that gets signed.
    pub fn signing_hash(&self) -> Result<B256, InvoiceError> {
        Ok(keccak256(self.canonical_json()?))
    }

    /// Attach a signature (and optionally the signer's public key).
    pub fn with_signature(mut self, signature: Signature, public_key: Option<Bytes>) -> Self {
        self.signature = Some(Bytes::copy_from_slice(&signature.as_bytes()));
        self.public_key = public_key;
        self
    }

    fn parse_signature(&self) -> Result<Signature, InvoiceError> {
        let raw = self.signature.as_ref().ok_or(InvoiceError::NotSigned)?;
        if raw.len() != 65 {
            return Err(InvoiceError::SignatureRecovery(format!(
                "invalid signature length: expected 65, got {}",
                raw.len()
            )));
        }
        Signature::try_from(raw.as_ref())
            .map_err(|e| InvoiceError::SignatureRecovery(format!("invalid signature: {e}")))
    }

    /// Recover the signer address from the attached signature.
    pub fn recover_signer(&self) -> Result<Address, InvoiceError> {
        let sig = self.parse_signature()?;
        let hash = self.signing_hash()?;
        sig.recover_address_from_prehash(&hash)
            .map_err(|e| InvoiceError::SignatureRecovery(format!("recovery failed: {e}")))
    }

    /// Verify that this invoice was signed by `sender`.
    ///
    /// When a public key is attached, the address derived from it must also
    /// match the declared sender.
    pub fn verify(&self, sender: &PeerId) -> Result<(), InvoiceError> {
        if let Some(pk) = &self.public_key {
            let derived = address_from_public_key(pk)?;
            if derived != sender.address() {
                return Err(InvoiceError::InvalidSigner {
                    expected: sender.address(),
                    actual: derived,
                });
            }
        }

        let signer = self.recover_signer()?;
        if signer != sender.address() {
            return Err(InvoiceError::InvalidSigner {
                expected: sender.address(),
                actual: signer,
            });
        }
        Ok(())
    }
}

/// Derive an Ethereum address from an uncompressed SEC1 public key.
///
/// Accepts the 65-byte `0x04`-prefixed form and the raw 64-byte form.
fn address_from_public_key(pk: &Bytes) -> Result<Address, InvoiceError> {
    let raw: &[u8] = match pk.len() {
        65 if pk.first() == Some(&0x04) => &pk[1..],
        64 => pk.as_ref(),
        n => {
            return Err(InvoiceError::BadPublicKey(format!(
                "expected 64 or 65 bytes, got {n}"
            )));
        }
    };
    Ok(Address::from_raw_public_key(raw))
}

/// Proof that an invoice was paid on-chain.
///
/// `(tx_hash, chain_id)` enters the processed-proof set at most once; the
/// set is the replay-protection gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    /// The invoice this proof settles.
    pub invoice_id: String,
    /// Hash of the settling transaction.
    pub tx_hash: B256,
    /// Chain the transaction landed on.
    pub chain_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use assert_matches::assert_matches;

    fn test_invoice() -> Invoice {
        Invoice::new(
            "job-1",
            1,
            "ETH",
            None,
            "1.5",
            Address::repeat_byte(0x02),
            60_000,
        )
    }

    fn sign(invoice: Invoice, signer: &PrivateKeySigner) -> Invoice {
        let hash = invoice.signing_hash().unwrap();
        let sig = signer.sign_hash_sync(&hash).unwrap();
        invoice.with_signature(sig, None)
    }

    #[test]
    fn test_validate_accepts_fresh_invoice() {
        test_invoice().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_window() {
        let mut invoice = test_invoice();
        invoice.valid_until = invoice.created_at;
        assert_matches!(
            invoice.validate(),
            Err(InvoiceError::InvalidValidity { .. })
        );
    }

    #[test]
    fn test_validate_rejects_bad_amount() {
        let mut invoice = test_invoice();
        invoice.amount = "not-a-number".into();
        assert_matches!(invoice.validate(), Err(InvoiceError::Amount(_)));
    }

    #[test]
    fn test_canonical_json_excludes_signature_fields() {
        let signer = PrivateKeySigner::random();
        let unsigned = test_invoice();
        let signed = sign(unsigned.clone(), &signer);

        // Signing must not change the canonical form.
        assert_eq!(
            unsigned.canonical_json().unwrap(),
            signed.canonical_json().unwrap()
        );

        let json = String::from_utf8(signed.canonical_json().unwrap()).unwrap();
        assert!(!json.contains("signature"));
        assert!(!json.contains("publicKey"));
        assert!(!json.contains(' '));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let json = String::from_utf8(test_invoice().canonical_json().unwrap()).unwrap();
        let amount = json.find("\"amount\"").unwrap();
        let chain = json.find("\"chainId\"").unwrap();
        let valid = json.find("\"validUntil\"").unwrap();
        assert!(amount < chain && chain < valid);
    }

    #[test]
    fn test_wire_json_uses_camel_case() {
        let json = serde_json::to_string(&test_invoice()).unwrap();
        assert!(json.contains("jobId"));
        assert!(json.contains("tokenAddress"));
        assert!(json.contains("validUntil"));
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = PrivateKeySigner::random();
        let invoice = sign(test_invoice(), &signer);

        assert!(invoice.is_signed());
        assert_eq!(invoice.recover_signer().unwrap(), signer.address());
        invoice.verify(&PeerId::new(signer.address())).unwrap();
    }

    #[test]
    fn test_verify_wrong_sender_fails() {
        let signer = PrivateKeySigner::random();
        let invoice = sign(test_invoice(), &signer);

        assert_matches!(
            invoice.verify(&PeerId::new(Address::repeat_byte(0x99))),
            Err(InvoiceError::InvalidSigner { .. })
        );
    }

    #[test]
    fn test_verify_unsigned_fails() {
        assert_matches!(
            test_invoice().verify(&PeerId::random()),
            Err(InvoiceError::NotSigned)
        );
    }

    #[test]
    fn test_tampered_amount_fails_verification() {
        let signer = PrivateKeySigner::random();
        let mut invoice = sign(test_invoice(), &signer);
        invoice.amount = "999".into();

        assert_matches!(
            invoice.verify(&PeerId::new(signer.address())),
            Err(InvoiceError::InvalidSigner { .. })
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let invoice = test_invoice();
        let json = serde_json::to_string(&invoice).unwrap();
        let decoded: Invoice = serde_json::from_str(&json).unwrap();
        assert_eq!(invoice, decoded);
    }

    #[test]
    fn test_postcard_roundtrip() {
        // Invoices are embedded in timed-out payment rows, which are stored
        // as postcard blobs.
        let invoice = test_invoice();
        let bytes = postcard::to_allocvec(&invoice).unwrap();
        let decoded: Invoice = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(invoice, decoded);
    }

    #[test]
    fn test_proof_roundtrip() {
        let proof = PaymentProof {
            invoice_id: "inv-1".into(),
            tx_hash: B256::repeat_byte(0xab),
            chain_id: 1,
        };
        let json = serde_json::to_string(&proof).unwrap();
        assert!(json.contains("txHash"));
        assert_eq!(serde_json::from_str::<PaymentProof>(&json).unwrap(), proof);
    }
}
