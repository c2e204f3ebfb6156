//! StreamVerse core: the pieces of pay-per-chunk streaming that do not
//! depend on a transport.
//!
//! - [`asset`]: the free metadata record clients fetch before streaming
//! - [`chunk`]: deterministic split of an asset into time chunks and byte ranges
//! - [`payment`]: x402 challenge, proof and receipt messages
//! - [`settlement`]: the verifier capability the gate delegates to
//! - [`voucher`]: ed25519 vouchers and their local verifier
//! - [`replay`]: single-use tracking of consumed proofs
//! - [`gate`]: the payment gate itself
//! - [`storage`]: asset bytes by content address
//! - [`verify`]: content addressing

pub mod asset;
pub mod chunk;
pub mod error;
pub mod gate;
pub mod payment;
pub mod replay;
pub mod settlement;
pub mod storage;
pub mod verify;
pub mod voucher;

pub use asset::AssetInfo;
pub use error::{PlaybackStatus, StreamError};
pub use gate::{GateConfig, GateDecision, PaymentGate, Rejection};
pub use payment::{
    PaymentProof, PaymentRequiredResponse, PaymentRequirements, ResourceId, SettlementReceipt,
};
