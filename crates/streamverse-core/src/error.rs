//! Error taxonomy shared by the gate's callers and the streaming client.

use thiserror::Error;

/// What the playback surface should tell the viewer. Recovery differs:
/// approve a payment, wait and retry, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    WaitingOnPayment,
    NetworkTrouble,
    Unavailable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// No proof or an insufficient one. Drives pay-then-retry; not a fault.
    #[error("payment required")]
    PaymentRequired,
    /// Proof present but invalid, expired, underpaid or scoped elsewhere.
    /// A new proof is needed; resending this one is pointless.
    #[error("payment rejected: {0}")]
    PaymentRejected(String),
    /// Proof already consumed. Never retried silently.
    #[error("payment proof already used")]
    ReplayDetected,
    /// Unknown asset or chunk index out of range.
    #[error("not found: {0}")]
    ResourceNotFound(String),
    /// Settlement infrastructure down or slow. Retryable.
    #[error("settlement verifier unavailable: {0}")]
    VerifierUnavailable(String),
    /// Connection failure, timeout or unexpected server error. Retryable.
    #[error("network error: {0}")]
    TransientNetwork(String),
    /// The server could not decode the proof we sent.
    #[error("malformed payment proof: {0}")]
    MalformedProof(String),
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error("playback sink error: {0}")]
    Sink(String),
}

impl StreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::VerifierUnavailable(_) | StreamError::TransientNetwork(_)
        )
    }

    pub fn playback_status(&self) -> PlaybackStatus {
        match self {
            StreamError::PaymentRequired
            | StreamError::PaymentRejected(_)
            | StreamError::Wallet(_) => PlaybackStatus::WaitingOnPayment,
            StreamError::VerifierUnavailable(_) | StreamError::TransientNetwork(_) => {
                PlaybackStatus::NetworkTrouble
            }
            StreamError::ReplayDetected
            | StreamError::ResourceNotFound(_)
            | StreamError::MalformedProof(_)
            | StreamError::Sink(_) => PlaybackStatus::Unavailable,
        }
    }
}
