//! x402 payment messages exchanged between the gate and a paying client.
//!
//! A server challenges with HTTP 402 and a [`PaymentRequiredResponse`]
//! listing the [`PaymentRequirements`] it accepts. The client answers with
//! an `X-PAYMENT` header carrying a base64 JSON [`PaymentProof`]. On
//! success the server attaches an `X-PAYMENT-RESPONSE` header with the
//! base64 JSON [`SettlementReceipt`].
//!
//! The proof `payload` is opaque here. Only the settlement verifier looks
//! inside it.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::verify;
use crate::voucher::SignedVoucher;

/// Protocol version carried in every x402 message.
pub const X402_VERSION: u8 = 1;

/// Request header carrying the payment proof.
pub const PAYMENT_HEADER: &str = "x-payment";

/// Response header carrying the settlement receipt.
pub const PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";

/// On-chain EIP-3009 transfer authorization, settled by a facilitator.
pub const SCHEME_EXACT: &str = "exact";

/// Ed25519-signed voucher, settled locally (see [`crate::voucher`]).
pub const SCHEME_VOUCHER: &str = "voucher";

/// Upper bound on an encoded header. Proofs are small; anything larger is
/// rejected before decoding.
pub const MAX_HEADER_LEN: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("empty payment header")]
    Empty,
    #[error("payment header too large: {0} bytes")]
    TooLarge(usize),
    #[error("payment header is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payment header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported x402 version: {0}")]
    UnsupportedVersion(u8),
}

// ---------------------------------------------------------------------------
// Resource identifiers
// ---------------------------------------------------------------------------

/// A priced resource: one chunk of one asset. Rendered as `<asset>#<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub asset: String,
    pub index: u32,
}

impl ResourceId {
    pub fn new(asset: impl Into<String>, index: u32) -> Self {
        Self {
            asset: asset.into(),
            index,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.asset, self.index)
    }
}

// ---------------------------------------------------------------------------
// Challenge
// ---------------------------------------------------------------------------

/// One acceptable way to pay for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Price in atomic units of `asset` (USDC: 6 decimals).
    #[serde(with = "amount_string")]
    pub max_amount_required: u64,
    /// The [`ResourceId`] being paid for, as a string.
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    /// Currency identifier (token symbol or contract address).
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Body of a 402 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    pub x402_version: u8,
    /// Set only when a supplied proof was turned down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub accepts: Vec<PaymentRequirements>,
}

impl PaymentRequiredResponse {
    pub fn new(accepts: Vec<PaymentRequirements>, error: Option<String>) -> Self {
        Self {
            x402_version: X402_VERSION,
            error,
            accepts,
        }
    }
}

// ---------------------------------------------------------------------------
// Proof
// ---------------------------------------------------------------------------

/// Payment proof supplied by the payer in the `X-PAYMENT` header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub x402_version: u8,
    pub scheme: String,
    pub network: String,
    pub payload: Value,
}

impl PaymentProof {
    /// Stable identifier used for replay detection.
    ///
    /// Vouchers are identified by signer and nonce, EIP-3009 authorizations
    /// by their nonce. Anything else falls back to the hash of its canonical
    /// JSON payload (object keys are sorted by `serde_json::Map`).
    pub fn proof_id(&self) -> String {
        if self.scheme == SCHEME_VOUCHER {
            if let Ok(signed) = SignedVoucher::from_proof(self) {
                return signed.replay_id();
            }
        }
        let nonce = self
            .payload
            .get("authorization")
            .and_then(|a| a.get("nonce"))
            .and_then(Value::as_str);
        match nonce {
            Some(n) => format!("nonce:{}", n.to_ascii_lowercase()),
            None => {
                let canonical = serde_json::to_vec(&self.payload).unwrap_or_default();
                format!("sha256:{}", verify::sha256_hex(&canonical))
            }
        }
    }

    pub fn to_header(&self) -> Result<String, HeaderError> {
        encode_header(self)
    }

    pub fn from_header(header: &str) -> Result<Self, HeaderError> {
        let proof: Self = decode_header(header)?;
        if proof.x402_version != X402_VERSION {
            return Err(HeaderError::UnsupportedVersion(proof.x402_version));
        }
        Ok(proof)
    }
}

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

/// What the verifier reports after accepting a proof. Returned to the client
/// so it can audit what it was charged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub success: bool,
    pub transaction: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl SettlementReceipt {
    pub fn to_header(&self) -> Result<String, HeaderError> {
        encode_header(self)
    }

    pub fn from_header(header: &str) -> Result<Self, HeaderError> {
        decode_header(header)
    }
}

fn encode_header<T: Serialize>(value: &T) -> Result<String, HeaderError> {
    Ok(BASE64.encode(serde_json::to_vec(value)?))
}

fn decode_header<T: for<'de> Deserialize<'de>>(header: &str) -> Result<T, HeaderError> {
    let header = header.trim();
    if header.is_empty() {
        return Err(HeaderError::Empty);
    }
    if header.len() > MAX_HEADER_LEN {
        return Err(HeaderError::TooLarge(header.len()));
    }
    let bytes = BASE64.decode(header)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Render atomic units of a 6-decimal token (USDC) as a decimal string,
/// e.g. `1000` -> `"0.001"`.
pub fn format_units(amount: u64) -> String {
    const SCALE: u64 = 1_000_000;
    let whole = amount / SCALE;
    let frac = amount % SCALE;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:06}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

/// Amounts travel as decimal strings on the wire; numbers are accepted too.
pub(crate) mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: SCHEME_EXACT.into(),
            network: "polygon-amoy".into(),
            max_amount_required: 1000,
            resource: ResourceId::new("ab".repeat(32), 3).to_string(),
            description: "10-second video chunk".into(),
            mime_type: "application/octet-stream".into(),
            pay_to: "0x1111111111111111111111111111111111111111".into(),
            max_timeout_seconds: 300,
            asset: "USDC".into(),
            extra: None,
        }
    }

    #[test]
    fn test_resource_id_display() {
        assert_eq!(ResourceId::new("cafe", 12).to_string(), "cafe#12");
    }

    #[test]
    fn test_requirements_wire_shape() {
        let v = serde_json::to_value(requirements()).unwrap();
        assert_eq!(v["maxAmountRequired"], json!("1000"));
        assert_eq!(v["payTo"], json!("0x1111111111111111111111111111111111111111"));
        assert_eq!(v["maxTimeoutSeconds"], json!(300));
        assert!(v.get("extra").is_none());
    }

    #[test]
    fn test_amount_accepts_numbers() {
        let mut v = serde_json::to_value(requirements()).unwrap();
        v["maxAmountRequired"] = json!(2500);
        let r: PaymentRequirements = serde_json::from_value(v).unwrap();
        assert_eq!(r.max_amount_required, 2500);
    }

    #[test]
    fn test_challenge_omits_error_when_unset() {
        let body = PaymentRequiredResponse::new(vec![requirements()], None);
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["x402Version"], json!(1));
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_proof_header_decoding() {
        let proof = PaymentProof {
            x402_version: X402_VERSION,
            scheme: SCHEME_EXACT.into(),
            network: "polygon-amoy".into(),
            payload: json!({"signature": "0xdead", "authorization": {"nonce": "0xABC"}}),
        };
        let header = proof.to_header().unwrap();
        assert_eq!(PaymentProof::from_header(&header).unwrap(), proof);
        assert!(matches!(PaymentProof::from_header(""), Err(HeaderError::Empty)));
        assert!(matches!(
            PaymentProof::from_header("!!!not base64!!!"),
            Err(HeaderError::Base64(_))
        ));
        let not_json = BASE64.encode(b"plain text");
        assert!(matches!(PaymentProof::from_header(&not_json), Err(HeaderError::Json(_))));
        let huge = "A".repeat(MAX_HEADER_LEN + 4);
        assert!(matches!(PaymentProof::from_header(&huge), Err(HeaderError::TooLarge(_))));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let raw = json!({"x402Version": 9, "scheme": "exact", "network": "n", "payload": {}});
        let header = BASE64.encode(serde_json::to_vec(&raw).unwrap());
        assert!(matches!(
            PaymentProof::from_header(&header),
            Err(HeaderError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_proof_id_prefers_authorization_nonce() {
        let proof = PaymentProof {
            x402_version: 1,
            scheme: SCHEME_EXACT.into(),
            network: "base".into(),
            payload: json!({"authorization": {"nonce": "0xABCD"}, "signature": "0x1"}),
        };
        assert_eq!(proof.proof_id(), "nonce:0xabcd");
    }

    #[test]
    fn test_proof_id_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"c":2,"d":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"d":3,"c":2},"a":1}"#).unwrap();
        let mk = |payload| PaymentProof {
            x402_version: 1,
            scheme: SCHEME_VOUCHER.into(),
            network: "n".into(),
            payload,
        };
        assert_eq!(mk(a).proof_id(), mk(b).proof_id());
        assert!(mk(json!({"a": 2})).proof_id().starts_with("sha256:"));
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(1000), "0.001");
        assert_eq!(format_units(13_000), "0.013");
        assert_eq!(format_units(2_500_000), "2.5");
        assert_eq!(format_units(3_000_000), "3");
        assert_eq!(format_units(0), "0");
    }
}
