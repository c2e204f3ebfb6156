pub mod chunks;
pub mod sse;
pub mod videos;

use axum::extract::State;
use axum::response::Json;

use crate::catalog::AssetEntry;
use crate::state::AppState;

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": crate::SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "network": state.gate.config().network,
    }))
}

/// GET /api/catalog
pub async fn catalog_handler(State(state): State<AppState>) -> Json<Vec<AssetEntry>> {
    let cat = state.catalog.lock().unwrap().clone();
    Json(cat)
}
