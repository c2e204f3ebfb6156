// ---------------------------------------------------------------------------
// Paid chunk delivery and free asset info
// ---------------------------------------------------------------------------

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use streamverse_core::gate::{GateDecision, Rejection};
use streamverse_core::payment::{PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER};
use streamverse_core::ResourceId;

use crate::state::*;

const RETRY_AFTER_SECS: &str = "5";

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// GET /info?asset=
/// Duration, chunk layout and price of an asset. Free.
pub async fn info_handler(
    State(state): State<AppState>,
    Query(q): Query<InfoQuery>,
) -> Response {
    let Some(asset) = q.asset.filter(|a| !a.is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "missing asset");
    };
    match state.find_asset(&asset) {
        Some(entry) => {
            let info = entry.info(state.gate.config());
            if !info.is_available() {
                return error(StatusCode::NOT_FOUND, "asset has no chunks");
            }
            Json(info).into_response()
        }
        None => error(StatusCode::NOT_FOUND, "asset not found"),
    }
}

/// GET /chunk?asset=&index=
/// Serves one chunk's bytes, and only once the gate has accepted a payment
/// for exactly that chunk.
pub async fn chunk_handler(
    State(state): State<AppState>,
    Query(q): Query<ChunkQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(asset) = q.asset.filter(|a| !a.is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "missing asset");
    };
    let index: u32 = match q.index.as_deref().map(str::parse) {
        Some(Ok(i)) => i,
        Some(Err(_)) => return error(StatusCode::BAD_REQUEST, "index must be a non-negative integer"),
        None => return error(StatusCode::BAD_REQUEST, "missing index"),
    };

    let Some(entry) = state.find_asset(&asset) else {
        return error(StatusCode::NOT_FOUND, "asset not found");
    };
    let plan = entry.plan();
    let Some(range) = plan.get(index) else {
        return error(
            StatusCode::NOT_FOUND,
            format!("chunk index {index} out of range (0..{})", plan.count()),
        );
    };

    let payment = match headers.get(PAYMENT_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(v)) => Some(v),
        Some(Err(_)) => return error(StatusCode::BAD_REQUEST, "payment header is not ASCII"),
    };

    // Nothing is charged for bytes we cannot produce.
    match state.objects.size(&entry.content_address).await {
        Ok(size) if size == entry.size_bytes => {}
        Ok(size) => {
            tracing::error!(
                asset = %entry.content_address,
                expected = entry.size_bytes,
                found = size,
                "stored object does not match the catalog"
            );
            return error(StatusCode::INTERNAL_SERVER_ERROR, "asset content unavailable");
        }
        Err(e) => {
            tracing::error!(asset = %entry.content_address, "stored object unreadable: {e}");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "asset content unavailable");
        }
    }

    let resource = ResourceId::new(entry.content_address.clone(), index);
    let decision = state
        .gate
        .evaluate(&resource, entry.price_per_chunk, payment)
        .await;

    let receipt = match decision {
        GateDecision::Accepted(receipt) => receipt,
        GateDecision::PaymentRequired(challenge) => {
            return (StatusCode::PAYMENT_REQUIRED, Json(challenge)).into_response();
        }
        GateDecision::Rejected {
            rejection,
            challenge,
        } => {
            let event = match &rejection {
                Rejection::Invalid(_) => "PAYMENT_REJECTED",
                Rejection::Replay => "PAYMENT_REPLAYED",
                Rejection::Malformed(_) => "PAYMENT_MALFORMED",
                Rejection::VerifierUnavailable(_) => "VERIFIER_UNAVAILABLE",
            };
            state.emitter.emit(
                "gate",
                event,
                serde_json::json!({
                    "resource": resource.to_string(),
                    "reason": challenge.error,
                }),
            );
            return match rejection {
                Rejection::Invalid(_) => {
                    (StatusCode::PAYMENT_REQUIRED, Json(challenge)).into_response()
                }
                Rejection::Replay => (StatusCode::CONFLICT, Json(challenge)).into_response(),
                Rejection::Malformed(reason) => {
                    error(StatusCode::BAD_REQUEST, format!("malformed payment: {reason}"))
                }
                Rejection::VerifierUnavailable(reason) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [("retry-after", RETRY_AFTER_SECS)],
                    Json(serde_json::json!({ "error": reason })),
                )
                    .into_response(),
            };
        }
    };

    state.emitter.emit(
        "gate",
        "PAYMENT_ACCEPTED",
        serde_json::json!({
            "resource": resource.to_string(),
            "transaction": receipt.transaction,
            "payer": receipt.payer,
            "amount": entry.price_per_chunk,
        }),
    );

    // Paid for. If the bytes or the receipt cannot be produced now, hand the
    // proof back so the payer can retry with it.
    let served = match state
        .objects
        .read_range(&entry.content_address, range.start, range.end)
        .await
    {
        Ok(bytes) => receipt.to_header().map(|h| (bytes, h)).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let (bytes, receipt_header) = match served {
        Ok(served) => served,
        Err(e) => {
            tracing::error!(%resource, transaction = %receipt.transaction, "paid chunk not served: {e}");
            if let Some(header) = payment {
                state.gate.release_payment(&resource, header).await;
            }
            state.emitter.emit(
                "gate",
                "PAYMENT_RELEASED",
                serde_json::json!({ "resource": resource.to_string(), "reason": e }),
            );
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [("retry-after", RETRY_AFTER_SECS)],
                Json(serde_json::json!({ "error": "chunk unavailable" })),
            )
                .into_response();
        }
    };

    state.emitter.emit(
        "gate",
        "CHUNK_SERVED",
        serde_json::json!({ "resource": resource.to_string(), "bytes": bytes.len() }),
    );

    let content_range = match range.last_byte() {
        Some(last) => format!("bytes {}-{}/{}", range.start, last, entry.size_bytes),
        None => format!("bytes */{}", entry.size_bytes),
    };
    let chunk_time = plan
        .span(index)
        .map(|(start, end)| format!("{start:.3}-{end:.3}"))
        .unwrap_or_default();
    (
        StatusCode::OK,
        [
            ("content-type", "application/octet-stream".to_string()),
            ("x-chunk-index", index.to_string()),
            ("x-total-chunks", plan.count().to_string()),
            ("x-chunk-range", content_range),
            ("x-chunk-time", chunk_time),
            (PAYMENT_RESPONSE_HEADER, receipt_header),
            ("cache-control", "no-store".to_string()),
        ],
        bytes,
    )
        .into_response()
}
