//! Payment gate: no valid payment, no bytes.
//!
//! [`PaymentGate::evaluate`] turns an optional `X-PAYMENT` header into a
//! [`GateDecision`]. The caller serves the resource only on
//! [`GateDecision::Accepted`]; every other outcome, including verifier
//! failure, denies access.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::payment::{
    PaymentProof, PaymentRequiredResponse, PaymentRequirements, ResourceId, SettlementReceipt,
    SCHEME_VOUCHER,
};
use crate::replay::{ReplayKey, ReplayStore};
use crate::settlement::{SettlementVerifier, Verification, VerifierError};

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Recipient address written into every requirement.
    pub pay_to: String,
    pub network: String,
    /// Proof scheme the configured verifier understands.
    pub scheme: String,
    /// Currency identifier (`asset` in x402 terms).
    pub currency: String,
    pub description: String,
    pub mime_type: String,
    /// How long a payer may take to settle, advertised to clients.
    pub max_timeout_seconds: u64,
    /// How long a consumed proof is remembered.
    pub replay_window: Duration,
    /// Upper bound on one verifier call.
    pub verify_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            pay_to: "0x0000000000000000000000000000000000000000".into(),
            network: "polygon-amoy".into(),
            scheme: SCHEME_VOUCHER.into(),
            currency: "USDC".into(),
            description: "10-second video chunk".into(),
            mime_type: "application/octet-stream".into(),
            max_timeout_seconds: 300,
            replay_window: Duration::from_secs(600),
            verify_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a supplied proof did not unlock the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Verifier said no: wrong amount, wrong resource, expired, bad signature.
    Invalid(String),
    /// Proof already consumed for this resource.
    Replay,
    /// Header could not be decoded at all.
    Malformed(String),
    /// Verifier unreachable, timed out, or replay store failed. Retryable.
    VerifierUnavailable(String),
}

impl From<Rejection> for StreamError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::Invalid(reason) => StreamError::PaymentRejected(reason),
            Rejection::Replay => StreamError::ReplayDetected,
            Rejection::Malformed(reason) => StreamError::MalformedProof(reason),
            Rejection::VerifierUnavailable(reason) => StreamError::VerifierUnavailable(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// No proof supplied. Carry the challenge back to the client.
    PaymentRequired(PaymentRequiredResponse),
    /// Proof verified and consumed. Serve the resource with this receipt.
    Accepted(SettlementReceipt),
    /// Proof supplied but not accepted. `challenge` lets the client build a
    /// fresh one.
    Rejected {
        rejection: Rejection,
        challenge: PaymentRequiredResponse,
    },
}

#[derive(Debug, Clone)]
pub struct PaymentGate {
    config: GateConfig,
    verifier: Arc<dyn SettlementVerifier>,
    replay: Arc<dyn ReplayStore>,
}

impl PaymentGate {
    pub fn new(
        config: GateConfig,
        verifier: Arc<dyn SettlementVerifier>,
        replay: Arc<dyn ReplayStore>,
    ) -> Self {
        Self {
            config,
            verifier,
            replay,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Requirements for paying `price` atomic units for `resource`.
    pub fn requirements(&self, resource: &ResourceId, price: u64) -> PaymentRequirements {
        PaymentRequirements {
            scheme: self.config.scheme.clone(),
            network: self.config.network.clone(),
            max_amount_required: price,
            resource: resource.to_string(),
            description: self.config.description.clone(),
            mime_type: self.config.mime_type.clone(),
            pay_to: self.config.pay_to.clone(),
            max_timeout_seconds: self.config.max_timeout_seconds,
            asset: self.config.currency.clone(),
            extra: None,
        }
    }

    /// Decide whether the request for `resource` may be served.
    pub async fn evaluate(
        &self,
        resource: &ResourceId,
        price: u64,
        payment_header: Option<&str>,
    ) -> GateDecision {
        let requirements = self.requirements(resource, price);

        let Some(header) = payment_header else {
            debug!(%resource, "no payment supplied");
            return GateDecision::PaymentRequired(PaymentRequiredResponse::new(
                vec![requirements],
                None,
            ));
        };

        let proof = match PaymentProof::from_header(header) {
            Ok(p) => p,
            Err(e) => {
                debug!(%resource, "undecodable payment header: {e}");
                return reject(requirements, Rejection::Malformed(e.to_string()));
            }
        };

        if proof.scheme != requirements.scheme || proof.network != requirements.network {
            return reject(
                requirements,
                Rejection::Invalid(format!(
                    "expected scheme {} on {}, got {} on {}",
                    self.config.scheme, self.config.network, proof.scheme, proof.network
                )),
            );
        }

        let key = ReplayKey::new(resource, &proof);
        let claim = {
            let replay = self.replay.clone();
            let key = key.clone();
            let ttl = self.config.replay_window;
            tokio::task::spawn_blocking(move || replay.claim(&key, ttl)).await
        };
        match claim {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                warn!(%resource, proof_id = %key.proof_id, "replayed payment proof");
                return reject(requirements, Rejection::Replay);
            }
            Ok(Err(e)) => {
                warn!(%resource, "replay store failure: {e}");
                return reject(requirements, Rejection::VerifierUnavailable(e.to_string()));
            }
            Err(e) => {
                warn!(%resource, "replay claim task failed: {e}");
                return reject(requirements, Rejection::VerifierUnavailable(e.to_string()));
            }
        }

        let verdict = tokio::time::timeout(
            self.config.verify_timeout,
            self.verifier.verify(&proof, &requirements),
        )
        .await;

        match verdict {
            Ok(Ok(Verification::Accepted(receipt))) => {
                info!(
                    %resource,
                    proof_id = %key.proof_id,
                    transaction = %receipt.transaction,
                    "payment accepted"
                );
                GateDecision::Accepted(receipt)
            }
            Ok(Ok(Verification::Rejected(reason))) => {
                self.release(&key).await;
                debug!(%resource, %reason, "payment rejected");
                reject(requirements, Rejection::Invalid(reason))
            }
            Ok(Err(VerifierError::Unavailable(reason))) => {
                self.release(&key).await;
                warn!(%resource, %reason, "verifier unavailable");
                reject(requirements, Rejection::VerifierUnavailable(reason))
            }
            Err(_) => {
                self.release(&key).await;
                warn!(%resource, timeout = ?self.config.verify_timeout, "verifier timed out");
                reject(
                    requirements,
                    Rejection::VerifierUnavailable(format!(
                        "verification timed out after {:?}",
                        self.config.verify_timeout
                    )),
                )
            }
        }
    }

    /// Give back the claim on a proof that was accepted but could not be
    /// honoured, so the payer can present it again.
    pub async fn release_payment(&self, resource: &ResourceId, payment_header: &str) {
        if let Ok(proof) = PaymentProof::from_header(payment_header) {
            self.release(&ReplayKey::new(resource, &proof)).await;
        }
    }

    async fn release(&self, key: &ReplayKey) {
        let replay = self.replay.clone();
        let owned = key.clone();
        match tokio::task::spawn_blocking(move || replay.release(&owned)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(proof_id = %key.proof_id, "failed to release replay claim: {e}"),
            Err(e) => warn!(proof_id = %key.proof_id, "replay release task failed: {e}"),
        }
    }
}

fn reject(requirements: PaymentRequirements, rejection: Rejection) -> GateDecision {
    let reason = match &rejection {
        Rejection::Invalid(r) | Rejection::Malformed(r) | Rejection::VerifierUnavailable(r) => {
            r.clone()
        }
        Rejection::Replay => "payment proof already used".to_string(),
    };
    GateDecision::Rejected {
        rejection,
        challenge: PaymentRequiredResponse::new(vec![requirements], Some(reason)),
    }
}
