//! Where chunks come from: the gated HTTP endpoint, or anything that
//! answers the same way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::{debug, warn};

use streamverse_core::payment::{PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER};
use streamverse_core::{
    AssetInfo, PaymentProof, PaymentRequiredResponse, SettlementReceipt, StreamError,
};

/// One delivered chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPayload {
    pub index: u32,
    pub total_chunks: u32,
    pub bytes: Bytes,
    /// Settlement receipt for the payment that unlocked this chunk.
    pub receipt: Option<SettlementReceipt>,
}

/// How the source answered a chunk request. Transport and infrastructure
/// failures come back as `Err(StreamError)` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Delivered(ChunkPayload),
    /// No proof was sent. Pay one of `accepts` and ask again.
    PaymentRequired(PaymentRequiredResponse),
    /// A proof was sent and refused. The challenge describes what would be
    /// accepted instead.
    Rejected {
        reason: String,
        challenge: PaymentRequiredResponse,
    },
}

#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn info(&self, asset: &str) -> Result<AssetInfo, StreamError>;

    async fn fetch(
        &self,
        asset: &str,
        index: u32,
        proof: Option<&PaymentProof>,
    ) -> Result<FetchOutcome, StreamError>;
}

#[async_trait]
impl<T: ChunkSource + ?Sized> ChunkSource for Arc<T> {
    async fn info(&self, asset: &str) -> Result<AssetInfo, StreamError> {
        (**self).info(asset).await
    }

    async fn fetch(
        &self,
        asset: &str,
        index: u32,
        proof: Option<&PaymentProof>,
    ) -> Result<FetchOutcome, StreamError> {
        (**self).fetch(asset, index, proof).await
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Talks to a StreamVerse node: `GET /info?asset=` and
/// `GET /chunk?asset=&index=` with the proof in `X-PAYMENT`.
#[derive(Debug, Clone)]
pub struct HttpChunkSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpChunkSource {
    pub fn new(base_url: &str) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StreamError::TransientNetwork(e.to_string()))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn network_error(e: reqwest::Error) -> StreamError {
    StreamError::TransientNetwork(e.to_string())
}

/// Pull `{"error": "..."}` out of a failed response, falling back to the
/// status line.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn info(&self, asset: &str) -> Result<AssetInfo, StreamError> {
        let resp = self
            .http
            .get(format!("{}/info", self.base_url))
            .query(&[("asset", asset)])
            .send()
            .await
            .map_err(network_error)?;

        match resp.status() {
            StatusCode::OK => resp.json::<AssetInfo>().await.map_err(network_error),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                Err(StreamError::ResourceNotFound(error_message(resp).await))
            }
            status => Err(StreamError::TransientNetwork(format!(
                "info for {asset}: {status}"
            ))),
        }
    }

    async fn fetch(
        &self,
        asset: &str,
        index: u32,
        proof: Option<&PaymentProof>,
    ) -> Result<FetchOutcome, StreamError> {
        let mut req = self
            .http
            .get(format!("{}/chunk", self.base_url))
            .query(&[("asset", asset.to_string()), ("index", index.to_string())]);
        if let Some(proof) = proof {
            let header = proof
                .to_header()
                .map_err(|e| StreamError::MalformedProof(e.to_string()))?;
            req = req.header(PAYMENT_HEADER, header);
        }

        let resp = req.send().await.map_err(network_error)?;
        let status = resp.status();
        debug!(asset, index, %status, paid = proof.is_some(), "chunk response");

        match status {
            StatusCode::OK => {
                let headers = resp.headers().clone();
                let receipt = match headers.get(PAYMENT_RESPONSE_HEADER) {
                    Some(v) => match v.to_str().map(SettlementReceipt::from_header) {
                        Ok(Ok(r)) => Some(r),
                        _ => {
                            warn!(asset, index, "unreadable settlement receipt");
                            None
                        }
                    },
                    None => None,
                };
                let bytes = resp.bytes().await.map_err(network_error)?;
                Ok(FetchOutcome::Delivered(ChunkPayload {
                    index: header_u32(&headers, "x-chunk-index").unwrap_or(index),
                    total_chunks: header_u32(&headers, "x-total-chunks").unwrap_or(0),
                    bytes,
                    receipt,
                }))
            }
            StatusCode::PAYMENT_REQUIRED => {
                let challenge = resp
                    .json::<PaymentRequiredResponse>()
                    .await
                    .map_err(network_error)?;
                match (proof, challenge.error.clone()) {
                    (Some(_), reason) => Ok(FetchOutcome::Rejected {
                        reason: reason.unwrap_or_else(|| "payment not accepted".into()),
                        challenge,
                    }),
                    (None, _) => Ok(FetchOutcome::PaymentRequired(challenge)),
                }
            }
            StatusCode::CONFLICT => Err(StreamError::ReplayDetected),
            StatusCode::NOT_FOUND => Err(StreamError::ResourceNotFound(error_message(resp).await)),
            StatusCode::BAD_REQUEST => Err(StreamError::MalformedProof(error_message(resp).await)),
            StatusCode::SERVICE_UNAVAILABLE => {
                Err(StreamError::VerifierUnavailable(error_message(resp).await))
            }
            s => Err(StreamError::TransientNetwork(format!(
                "chunk {index}: unexpected status {s}"
            ))),
        }
    }
}
