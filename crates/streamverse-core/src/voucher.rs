//! Ed25519-signed payment vouchers.
//!
//! A voucher is the local settlement scheme: the payer signs
//! `(payer, pay_to, amount, resource, network, nonce, valid_before)` with an
//! ed25519 key and the [`VoucherVerifier`] checks the signature and the
//! terms. It lets a node run and be tested without a facilitator while
//! keeping the same gate and the same wire format as the `exact` scheme.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payment::{
    amount_string, PaymentProof, PaymentRequirements, SettlementReceipt, SCHEME_VOUCHER,
    X402_VERSION,
};
use crate::settlement::{SettlementVerifier, Verification, VerifierError};
use crate::verify;

const DOMAIN: &str = "streamverse-voucher/v1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VoucherError {
    #[error("malformed voucher: {0}")]
    Malformed(String),
    #[error("bad payer key: {0}")]
    BadKey(String),
    #[error("bad voucher signature")]
    BadSignature,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Terms the payer agrees to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    /// Hex ed25519 verifying key of the payer.
    pub payer: String,
    pub pay_to: String,
    #[serde(with = "amount_string")]
    pub amount: u64,
    pub resource: String,
    pub network: String,
    /// Random hex nonce; makes every voucher unique.
    pub nonce: String,
    /// Unix seconds after which the voucher is void.
    pub valid_before: u64,
}

impl Voucher {
    /// Build a voucher that exactly satisfies `requirements`.
    pub fn for_requirements(
        payer: &VerifyingKey,
        requirements: &PaymentRequirements,
        nonce: [u8; 32],
        now: u64,
    ) -> Self {
        Self {
            payer: hex::encode(payer.to_bytes()),
            pay_to: requirements.pay_to.clone(),
            amount: requirements.max_amount_required,
            resource: requirements.resource.clone(),
            network: requirements.network.clone(),
            nonce: hex::encode(nonce),
            valid_before: now + requirements.max_timeout_seconds,
        }
    }

    fn signing_message(&self) -> Vec<u8> {
        format!(
            "{DOMAIN}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
            self.payer,
            self.pay_to,
            self.amount,
            self.resource,
            self.network,
            self.nonce,
            self.valid_before
        )
        .into_bytes()
    }

    pub fn sign(self, key: &SigningKey) -> SignedVoucher {
        let signature = key.sign(&self.signing_message());
        SignedVoucher {
            voucher: self,
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "VoucherPayload", into = "VoucherPayload")]
pub struct SignedVoucher {
    pub voucher: Voucher,
    /// Hex ed25519 signature over the voucher's signing message.
    pub signature: String,
}

/// Wire form of a [`SignedVoucher`]: the voucher terms and the signature in
/// one flat object. Exactly one encoding is accepted per voucher, so a
/// payload cannot be padded or re-cased into something that looks new.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct VoucherPayload {
    payer: String,
    pay_to: String,
    #[serde(with = "amount_string")]
    amount: u64,
    resource: String,
    network: String,
    nonce: String,
    valid_before: u64,
    signature: String,
}

fn is_lower_hex(s: &str, bytes: usize) -> bool {
    s.len() == bytes * 2 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl TryFrom<VoucherPayload> for SignedVoucher {
    type Error = String;

    fn try_from(p: VoucherPayload) -> Result<Self, Self::Error> {
        if !is_lower_hex(&p.payer, 32) {
            return Err("payer must be 64 lowercase hex digits".into());
        }
        if !is_lower_hex(&p.nonce, 32) {
            return Err("nonce must be 64 lowercase hex digits".into());
        }
        if !is_lower_hex(&p.signature, 64) {
            return Err("signature must be 128 lowercase hex digits".into());
        }
        Ok(Self {
            voucher: Voucher {
                payer: p.payer,
                pay_to: p.pay_to,
                amount: p.amount,
                resource: p.resource,
                network: p.network,
                nonce: p.nonce,
                valid_before: p.valid_before,
            },
            signature: p.signature,
        })
    }
}

impl From<SignedVoucher> for VoucherPayload {
    fn from(s: SignedVoucher) -> Self {
        let v = s.voucher;
        Self {
            payer: v.payer,
            pay_to: v.pay_to,
            amount: v.amount,
            resource: v.resource,
            network: v.network,
            nonce: v.nonce,
            valid_before: v.valid_before,
            signature: s.signature,
        }
    }
}

impl SignedVoucher {
    pub fn into_proof(self) -> PaymentProof {
        let network = self.voucher.network.clone();
        PaymentProof {
            x402_version: X402_VERSION,
            scheme: SCHEME_VOUCHER.into(),
            network,
            payload: serde_json::to_value(self).unwrap_or_default(),
        }
    }

    pub fn from_proof(proof: &PaymentProof) -> Result<Self, VoucherError> {
        serde_json::from_value(proof.payload.clone())
            .map_err(|e| VoucherError::Malformed(e.to_string()))
    }

    pub fn check_signature(&self) -> Result<(), VoucherError> {
        let key_bytes: [u8; 32] = hex::decode(&self.voucher.payer)
            .map_err(|e| VoucherError::BadKey(e.to_string()))?
            .try_into()
            .map_err(|_| VoucherError::BadKey("expected 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| VoucherError::BadKey(e.to_string()))?;
        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .map_err(|_| VoucherError::BadSignature)?
            .try_into()
            .map_err(|_| VoucherError::BadSignature)?;
        key.verify_strict(&self.voucher.signing_message(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| VoucherError::BadSignature)
    }

    /// Replay identifier: the signer and the nonce they signed. Both are
    /// covered by the signature, so no re-encoding of the payload changes it.
    pub fn replay_id(&self) -> String {
        format!("voucher:{}:{}", self.voucher.payer, self.voucher.nonce)
    }

    /// Transaction reference reported in the receipt.
    pub fn transaction_ref(&self) -> String {
        format!("voucher:{}", verify::sha256_hex(&self.voucher.signing_message()))
    }
}

/// Sign a fresh voucher for `requirements`.
pub fn issue(key: &SigningKey, requirements: &PaymentRequirements, nonce: [u8; 32]) -> PaymentProof {
    Voucher::for_requirements(&key.verifying_key(), requirements, nonce, unix_now())
        .sign(key)
        .into_proof()
}

/// Local settlement verifier for [`SCHEME_VOUCHER`] proofs.
#[derive(Debug, Clone)]
pub struct VoucherVerifier {
    /// Longest validity a voucher may claim. Keep this at or below the
    /// gate's replay window so a consumed voucher cannot outlive its
    /// replay record.
    max_validity: Duration,
    clock: fn() -> u64,
}

impl VoucherVerifier {
    pub fn new(max_validity: Duration) -> Self {
        Self {
            max_validity,
            clock: unix_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Check a voucher against the requirements. `Err` carries the reason a
    /// payer would see.
    pub fn check(&self, proof: &PaymentProof, req: &PaymentRequirements) -> Result<SignedVoucher, String> {
        if proof.scheme != SCHEME_VOUCHER {
            return Err(format!("unsupported scheme: {}", proof.scheme));
        }
        let signed = SignedVoucher::from_proof(proof).map_err(|e| e.to_string())?;
        signed.check_signature().map_err(|e| e.to_string())?;

        let v = &signed.voucher;
        if v.network != req.network || proof.network != req.network {
            return Err(format!("wrong network: {}", v.network));
        }
        if !v.pay_to.eq_ignore_ascii_case(&req.pay_to) {
            return Err(format!("wrong recipient: {}", v.pay_to));
        }
        if v.resource != req.resource {
            return Err(format!(
                "voucher is scoped to {}, not {}",
                v.resource, req.resource
            ));
        }
        if v.amount < req.max_amount_required {
            return Err(format!(
                "insufficient amount: {} < {}",
                v.amount, req.max_amount_required
            ));
        }
        let now = (self.clock)();
        if v.valid_before <= now {
            return Err("voucher expired".into());
        }
        if v.valid_before - now > self.max_validity.as_secs() {
            return Err("voucher validity exceeds the accepted window".into());
        }
        Ok(signed)
    }
}

#[async_trait]
impl SettlementVerifier for VoucherVerifier {
    async fn verify(
        &self,
        proof: &PaymentProof,
        requirements: &PaymentRequirements,
    ) -> Result<Verification, VerifierError> {
        Ok(match self.check(proof, requirements) {
            Ok(signed) => Verification::Accepted(SettlementReceipt {
                success: true,
                transaction: signed.transaction_ref(),
                network: requirements.network.clone(),
                payer: Some(signed.voucher.payer),
            }),
            Err(reason) => Verification::Rejected(reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    const NOW: u64 = 1_700_000_000;

    fn fixed_clock() -> u64 {
        NOW
    }

    fn requirements(resource: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: SCHEME_VOUCHER.into(),
            network: "polygon-amoy".into(),
            max_amount_required: 1000,
            resource: resource.into(),
            description: String::new(),
            mime_type: "application/octet-stream".into(),
            pay_to: "0xAbC0000000000000000000000000000000000001".into(),
            max_timeout_seconds: 300,
            asset: "USDC".into(),
            extra: None,
        }
    }

    fn verifier() -> VoucherVerifier {
        VoucherVerifier::new(Duration::from_secs(600)).with_clock(fixed_clock)
    }

    fn voucher(key: &SigningKey, req: &PaymentRequirements) -> Voucher {
        Voucher::for_requirements(&key.verifying_key(), req, [7u8; 32], NOW)
    }

    #[tokio::test]
    async fn test_valid_voucher_accepted() {
        let key = SigningKey::generate(&mut OsRng);
        let req = requirements("aa#0");
        let proof = voucher(&key, &req).sign(&key).into_proof();
        match verifier().verify(&proof, &req).await.unwrap() {
            Verification::Accepted(receipt) => {
                assert!(receipt.success);
                assert!(receipt.transaction.starts_with("voucher:"));
                assert_eq!(receipt.payer, Some(hex::encode(key.verifying_key().to_bytes())));
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn test_scope_enforced() {
        let key = SigningKey::generate(&mut OsRng);
        let proof = voucher(&key, &requirements("aa#0")).sign(&key).into_proof();
        let err = verifier().check(&proof, &requirements("aa#1")).unwrap_err();
        assert!(err.contains("scoped to aa#0"), "{err}");
    }

    #[test]
    fn test_tampered_terms_fail_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let req = requirements("aa#0");
        let mut signed = voucher(&key, &req).sign(&key);
        signed.voucher.amount = 1;
        signed.voucher.resource = "aa#5".into();
        let err = verifier().check(&signed.into_proof(), &req).unwrap_err();
        assert_eq!(err, VoucherError::BadSignature.to_string());
    }

    #[test]
    fn test_underpayment_and_recipient() {
        let key = SigningKey::generate(&mut OsRng);
        let req = requirements("aa#0");

        let mut cheap = voucher(&key, &req);
        cheap.amount = 999;
        let err = verifier().check(&cheap.sign(&key).into_proof(), &req).unwrap_err();
        assert!(err.contains("insufficient"));

        let mut elsewhere = voucher(&key, &req);
        elsewhere.pay_to = "0xdead".into();
        let err = verifier().check(&elsewhere.sign(&key).into_proof(), &req).unwrap_err();
        assert!(err.contains("recipient"));

        // Recipient comparison is case-insensitive (hex addresses).
        let mut lower = voucher(&key, &req);
        lower.pay_to = req.pay_to.to_lowercase();
        assert!(verifier().check(&lower.sign(&key).into_proof(), &req).is_ok());
    }

    #[test]
    fn test_expiry_and_validity_window() {
        let key = SigningKey::generate(&mut OsRng);
        let req = requirements("aa#0");

        let mut stale = voucher(&key, &req);
        stale.valid_before = NOW;
        let err = verifier().check(&stale.sign(&key).into_proof(), &req).unwrap_err();
        assert!(err.contains("expired"));

        let mut forever = voucher(&key, &req);
        forever.valid_before = NOW + 86_400;
        let err = verifier().check(&forever.sign(&key).into_proof(), &req).unwrap_err();
        assert!(err.contains("window"));
    }

    #[test]
    fn test_wrong_scheme_and_garbage_payload() {
        let req = requirements("aa#0");
        let proof = PaymentProof {
            x402_version: X402_VERSION,
            scheme: "exact".into(),
            network: req.network.clone(),
            payload: serde_json::json!({}),
        };
        assert!(verifier().check(&proof, &req).unwrap_err().contains("scheme"));

        let proof = PaymentProof {
            scheme: SCHEME_VOUCHER.into(),
            ..proof
        };
        assert!(verifier().check(&proof, &req).unwrap_err().starts_with("malformed voucher"));
    }

    #[test]
    fn test_only_canonical_encoding_decodes() {
        let key = SigningKey::generate(&mut OsRng);
        let req = requirements("aa#0");
        let proof = voucher(&key, &req).sign(&key).into_proof();

        let mut padded = proof.clone();
        padded.payload["memo"] = serde_json::json!("again");
        let err = verifier().check(&padded, &req).unwrap_err();
        assert!(err.contains("unknown field"), "{err}");

        let mut shouting = proof.clone();
        let sig = shouting.payload["signature"].as_str().unwrap().to_uppercase();
        shouting.payload["signature"] = serde_json::json!(sig);
        let err = verifier().check(&shouting, &req).unwrap_err();
        assert!(err.contains("lowercase"), "{err}");

        assert!(verifier().check(&proof, &req).is_ok());
    }

    #[test]
    fn test_replay_id_follows_signed_terms() {
        let key = SigningKey::generate(&mut OsRng);
        let req = requirements("aa#0");
        let signed = voucher(&key, &req).sign(&key);
        let id = signed.replay_id();
        let amount = signed.voucher.amount;
        assert_eq!(
            id,
            format!("voucher:{}:{}", hex::encode(key.verifying_key().to_bytes()), hex::encode([7u8; 32]))
        );

        // Key order and amount encoding do not change the id.
        let mut proof = signed.into_proof();
        proof.payload["amount"] = serde_json::json!(amount);
        assert_eq!(proof.proof_id(), id);
    }
}
