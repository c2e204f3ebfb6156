// ---------------------------------------------------------------------------
// Video metadata API: /api/videos
// ---------------------------------------------------------------------------

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::state::*;
use crate::videos::{NewVideo, StoreError, UpdateError, ValidationError, Video, VideoUpdate};

const DEFAULT_PAGE_LIMIT: u32 = 10;
const MAX_PAGE_LIMIT: u32 = 100;

fn failure(status: StatusCode, error: &str, message: Option<String>) -> Response {
    let mut body = json!({ "success": false, "error": error });
    if let Some(m) = message {
        body["message"] = json!(m);
    }
    (status, Json(body)).into_response()
}

fn internal(what: &str, e: StoreError) -> Response {
    tracing::error!("{what}: {e}");
    failure(StatusCode::INTERNAL_SERVER_ERROR, what, Some(e.to_string()))
}

fn list(videos: Vec<Video>) -> Response {
    let count = videos.len();
    Json(json!({ "success": true, "data": videos, "count": count })).into_response()
}

fn one(video: Option<Video>, missing: &str) -> Response {
    match video {
        Some(v) => Json(json!({ "success": true, "data": v })).into_response(),
        None => failure(StatusCode::NOT_FOUND, missing, None),
    }
}

fn invalid(e: ValidationError) -> Response {
    match e {
        ValidationError::Missing => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": e.to_string(),
                "required": ["publicAddress", "title", "cid"],
            })),
        )
            .into_response(),
        other => failure(StatusCode::BAD_REQUEST, &other.to_string(), None),
    }
}

fn parse_id(raw: &str) -> Result<i64, Response> {
    raw.parse()
        .map_err(|_| failure(StatusCode::BAD_REQUEST, "Invalid video id", None))
}

/// GET /api/videos[?page=&limit=]
pub async fn list_videos(State(state): State<AppState>, Query(q): Query<PageQuery>) -> Response {
    if q.page.is_none() && q.limit.is_none() {
        return match state.videos.all() {
            Ok(v) => list(v),
            Err(e) => internal("Failed to fetch videos", e),
        };
    }
    let page = q.page.unwrap_or(1).max(1);
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    match state.videos.page(page, limit) {
        Ok((videos, pagination)) => Json(json!({
            "success": true,
            "data": videos,
            "pagination": pagination,
        }))
        .into_response(),
        Err(e) => internal("Failed to fetch videos", e),
    }
}

/// POST /api/videos
pub async fn create_video(State(state): State<AppState>, Json(body): Json<NewVideo>) -> Response {
    let video = match body.validate() {
        Ok(v) => v,
        Err(e) => return invalid(e),
    };
    match state.videos.create(&video) {
        Ok(created) => {
            state.emitter.emit(
                "metadata",
                "VIDEO_CREATED",
                json!({ "id": created.id, "cid": created.cid, "publicAddress": created.public_address }),
            );
            (
                StatusCode::CREATED,
                Json(json!({
                    "success": true,
                    "data": created,
                    "message": "Video created successfully",
                })),
            )
                .into_response()
        }
        Err(StoreError::DuplicateCid(_)) => failure(
            StatusCode::CONFLICT,
            "Video with this CID already exists",
            None,
        ),
        Err(e) => internal("Failed to create video", e),
    }
}

/// GET /api/videos/{id}
pub async fn get_video(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.videos.by_id(id) {
        Ok(v) => one(v, "Video not found"),
        Err(e) => internal("Failed to fetch video", e),
    }
}

/// PUT /api/videos/{id}
pub async fn update_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<VideoUpdate>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.videos.update(id, body) {
        Ok(Some(v)) => Json(json!({
            "success": true,
            "data": v,
            "message": "Video updated successfully",
        }))
        .into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Video not found", None),
        Err(UpdateError::Invalid(e)) => invalid(e),
        Err(UpdateError::Store(e)) => internal("Failed to update video", e),
    }
}

/// DELETE /api/videos/{id}
pub async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.videos.delete(id) {
        Ok(true) => {
            state
                .emitter
                .emit("metadata", "VIDEO_DELETED", json!({ "id": id }));
            Json(json!({ "success": true, "message": "Video deleted successfully" }))
                .into_response()
        }
        Ok(false) => failure(StatusCode::NOT_FOUND, "Video not found", None),
        Err(e) => internal("Failed to delete video", e),
    }
}

/// GET /api/videos/address/{address}
pub async fn videos_by_address(
    State(state): State<AppState>,
    AxumPath(address): AxumPath<String>,
) -> Response {
    match state.videos.by_address(&address) {
        Ok(v) => list(v),
        Err(e) => internal("Failed to fetch videos by address", e),
    }
}

/// GET /api/videos/cid/{cid}
pub async fn video_by_cid(
    State(state): State<AppState>,
    AxumPath(cid): AxumPath<String>,
) -> Response {
    match state.videos.by_cid(&cid) {
        Ok(v) => one(v, "Video with this CID not found"),
        Err(e) => internal("Failed to fetch video by CID", e),
    }
}

/// GET /api/videos/tag/{tag}
pub async fn videos_by_tag(
    State(state): State<AppState>,
    AxumPath(tag): AxumPath<String>,
) -> Response {
    match state.videos.by_tag(&tag) {
        Ok(v) => list(v),
        Err(e) => internal("Failed to fetch videos by tag", e),
    }
}

/// GET /api/videos/search?q=
pub async fn search_videos(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> Response {
    let Some(term) = q.q.filter(|t| !t.trim().is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "Missing search query", None);
    };
    match state.videos.search(term.trim()) {
        Ok(v) => list(v),
        Err(e) => internal("Failed to search videos", e),
    }
}

/// GET /api/videos/stats
pub async fn video_stats(State(state): State<AppState>) -> Response {
    match state.videos.stats() {
        Ok(stats) => Json(json!({ "success": true, "data": stats })).into_response(),
        Err(e) => internal("Failed to fetch video statistics", e),
    }
}
