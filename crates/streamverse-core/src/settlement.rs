//! Settlement verifier capability.
//!
//! The gate never inspects a proof's cryptography. It hands the proof and
//! the requirements it was issued against to a [`SettlementVerifier`] and
//! acts on pass/fail.

use async_trait::async_trait;
use thiserror::Error;

use crate::payment::{PaymentProof, PaymentRequirements, SettlementReceipt};

/// Verifier verdict on a proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Proof is valid and settled. The receipt goes back to the payer.
    Accepted(SettlementReceipt),
    /// Proof is stale, underpaid, signed wrongly or scoped to another
    /// resource. The payer has to build a new one.
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifierError {
    /// Infrastructure failure. Retryable; the gate fails closed.
    #[error("settlement verifier unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SettlementVerifier: Send + Sync + std::fmt::Debug + 'static {
    /// Verify and settle `proof` against `requirements`.
    async fn verify(
        &self,
        proof: &PaymentProof,
        requirements: &PaymentRequirements,
    ) -> Result<Verification, VerifierError>;
}
