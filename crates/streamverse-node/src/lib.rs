//! StreamVerse node: serves registered assets chunk by chunk behind the
//! x402 payment gate, plus the video metadata API and a live console
//! event stream.
//!
//! Routes:
//!   GET  /health
//!   GET  /info?asset=                 asset layout and price (free)
//!   GET  /chunk?asset=&index=         one chunk, 402 until paid
//!   GET  /api/catalog
//!   GET  /api/events                  SSE
//!   GET  /api/events/history
//!   /api/videos ...                   metadata CRUD

pub mod catalog;
pub mod cli;
pub mod events;
pub mod facilitator;
pub mod handlers;
pub mod state;
pub mod videos;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use handlers::{chunks, sse, videos as video_api};
use state::AppState;

pub const SERVICE_NAME: &str = "streamverse";

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/info", get(chunks::info_handler))
        .route("/chunk", get(chunks::chunk_handler))
        .route("/api/catalog", get(handlers::catalog_handler))
        .route("/api/events", get(sse::sse_handler))
        .route("/api/events/history", get(sse::events_history_handler))
        .route(
            "/api/videos",
            get(video_api::list_videos).post(video_api::create_video),
        )
        .route("/api/videos/stats", get(video_api::video_stats))
        .route("/api/videos/search", get(video_api::search_videos))
        .route("/api/videos/address/{address}", get(video_api::videos_by_address))
        .route("/api/videos/cid/{cid}", get(video_api::video_by_cid))
        .route("/api/videos/tag/{tag}", get(video_api::videos_by_tag))
        .route(
            "/api/videos/{id}",
            get(video_api::get_video)
                .put(video_api::update_video)
                .delete(video_api::delete_video),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `port` until Ctrl-C.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    state::spawn_replay_purge(state.replay.clone(), Duration::from_secs(60));
    let network = state.gate.config().network.clone();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, %network, "streamverse node listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("http server")
}
