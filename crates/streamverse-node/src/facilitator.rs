//! Settlement through a remote x402 facilitator: `POST {url}/verify`, then
//! `POST {url}/settle`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use streamverse_core::payment::X402_VERSION;
use streamverse_core::settlement::{SettlementVerifier, Verification, VerifierError};
use streamverse_core::{PaymentProof, PaymentRequirements, SettlementReceipt};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorRequest<'a> {
    x402_version: u8,
    payment_payload: &'a PaymentProof,
    payment_requirements: &'a PaymentRequirements,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponse {
    success: bool,
    #[serde(default)]
    error_reason: Option<String>,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    payer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FacilitatorVerifier {
    http: reqwest::Client,
    base_url: String,
}

impl FacilitatorVerifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST `body` to `{base}/{path}` and decode the reply. A 4xx with a
    /// decodable body is still an answer; anything else is an outage.
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &FacilitatorRequest<'_>,
    ) -> Result<T, VerifierError> {
        let url = format!("{}/{path}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| VerifierError::Unavailable(format!("{url}: {e}")))?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(VerifierError::Unavailable(format!("{url}: {status}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| VerifierError::Unavailable(format!("{url}: {status}: {e}")))
    }
}

#[async_trait]
impl SettlementVerifier for FacilitatorVerifier {
    async fn verify(
        &self,
        proof: &PaymentProof,
        requirements: &PaymentRequirements,
    ) -> Result<Verification, VerifierError> {
        let body = FacilitatorRequest {
            x402_version: X402_VERSION,
            payment_payload: proof,
            payment_requirements: requirements,
        };

        let verdict: VerifyResponse = self.call("verify", &body).await?;
        if !verdict.is_valid {
            let reason = verdict
                .invalid_reason
                .unwrap_or_else(|| "payment invalid".into());
            debug!(resource = %requirements.resource, %reason, "facilitator rejected payment");
            return Ok(Verification::Rejected(reason));
        }

        let settled: SettleResponse = self.call("settle", &body).await?;
        if !settled.success {
            let reason = settled
                .error_reason
                .unwrap_or_else(|| "settlement failed".into());
            return Ok(Verification::Rejected(reason));
        }
        let transaction = match settled.transaction {
            Some(tx) if !tx.is_empty() => tx,
            _ => {
                warn!(resource = %requirements.resource, "facilitator settled without a transaction");
                return Ok(Verification::Rejected(
                    "settlement returned no transaction reference".into(),
                ));
            }
        };
        Ok(Verification::Accepted(SettlementReceipt {
            success: true,
            transaction,
            network: settled
                .network
                .unwrap_or_else(|| requirements.network.clone()),
            payer: settled.payer,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn spawn_facilitator(verify: Value, settle: Value) -> String {
        let app = Router::new()
            .route("/verify", post(move || std::future::ready(Json(verify.clone()))))
            .route("/settle", post(move || std::future::ready(Json(settle.clone()))));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn fixtures() -> (PaymentProof, PaymentRequirements) {
        let proof = PaymentProof {
            x402_version: 1,
            scheme: "exact".into(),
            network: "polygon-amoy".into(),
            payload: json!({"signature": "0xabc"}),
        };
        let req = PaymentRequirements {
            scheme: "exact".into(),
            network: "polygon-amoy".into(),
            max_amount_required: 1000,
            resource: "ab#0".into(),
            description: String::new(),
            mime_type: "application/octet-stream".into(),
            pay_to: "0x1".into(),
            max_timeout_seconds: 300,
            asset: "USDC".into(),
            extra: None,
        };
        (proof, req)
    }

    #[tokio::test]
    async fn test_settled_payment_accepted() {
        let url = spawn_facilitator(
            json!({"isValid": true}),
            json!({"success": true, "transaction": "0xfeed", "network": "polygon-amoy", "payer": "0xpayer"}),
        )
        .await;
        let verifier = FacilitatorVerifier::new(&url, Duration::from_secs(5)).unwrap();
        let (proof, req) = fixtures();
        match verifier.verify(&proof, &req).await.unwrap() {
            Verification::Accepted(r) => {
                assert_eq!(r.transaction, "0xfeed");
                assert_eq!(r.payer.as_deref(), Some("0xpayer"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_payment_rejected() {
        let url = spawn_facilitator(
            json!({"isValid": false, "invalidReason": "insufficient_funds"}),
            json!({"success": true, "transaction": "0xfeed"}),
        )
        .await;
        let verifier = FacilitatorVerifier::new(&url, Duration::from_secs(5)).unwrap();
        let (proof, req) = fixtures();
        assert_eq!(
            verifier.verify(&proof, &req).await.unwrap(),
            Verification::Rejected("insufficient_funds".into())
        );
    }

    #[tokio::test]
    async fn test_missing_transaction_is_not_a_receipt() {
        let url = spawn_facilitator(json!({"isValid": true}), json!({"success": true})).await;
        let verifier = FacilitatorVerifier::new(&url, Duration::from_secs(5)).unwrap();
        let (proof, req) = fixtures();
        assert!(matches!(
            verifier.verify(&proof, &req).await,
            Ok(Verification::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_facilitator_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let verifier =
            FacilitatorVerifier::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let (proof, req) = fixtures();
        assert!(matches!(
            verifier.verify(&proof, &req).await,
            Err(VerifierError::Unavailable(_))
        ));
    }
}
