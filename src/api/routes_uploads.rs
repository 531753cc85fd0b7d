use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::dub_core::audit::EventCtx;
use crate::dub_core::auth::visibility::can_mutate;
use crate::dub_core::domain::Role;

use super::error::ApiError;
use super::extract::{authenticate, enforce_csrf, request_id};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct InitBody {
    pub filename: String,
    pub total_bytes: u64,
    #[serde(default)]
    pub mime: Option<String>,
}

pub async fn init(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<InitBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    identity.require_role(Role::Operator)?;
    identity.require_scope("submit:job")?;

    let upload = state
        .uploads
        .init(&identity.user_id, &body.filename, body.total_bytes)?;
    state.audit.event(
        "upload.init",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .resource(upload.id.clone())
            .request(request_id(&headers))
            .meta(json!({ "total_bytes": body.total_bytes, "mime": body.mime })),
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "upload_id": upload.id,
            "chunk_bytes": upload.chunk_bytes,
            "total_chunks": upload.total_chunks(),
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub index: u32,
    pub offset: u64,
}

fn require_upload_access(
    state: &AppState,
    identity: &crate::dub_core::auth::Identity,
    upload_id: &str,
) -> Result<(), ApiError> {
    let upload = state.uploads.get(upload_id)?;
    if !can_mutate(identity, &upload.owner_id) {
        return Err(ApiError::Forbidden("forbidden"));
    }
    Ok(())
}

pub async fn chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    require_upload_access(&state, &identity, &id)?;

    let per_s = state.settings.chunk_rate_per_s.max(1);
    if !state.auth.limiter.allow("upload_chunk", &id, per_s, 1.0) {
        return Err(ApiError::RateLimited);
    }

    let sha_header = headers
        .get("x-chunk-sha256")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-Chunk-Sha256".to_string()))?;

    let upload = state
        .uploads
        .put_chunk(&id, query.index, query.offset, &body, sha_header)?;
    Ok(Json(json!({
        "received_bytes": upload.received_bytes,
        "next_expected_chunk": upload.next_expected_chunk(),
    })))
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    require_upload_access(&state, &identity, &id)?;

    let upload = state.uploads.complete(&id)?;
    state.audit.event(
        "upload.complete",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .resource(upload.id.clone())
            .request(request_id(&headers))
            .meta(json!({ "total_bytes": upload.total_bytes })),
    );
    Ok(Json(json!({ "video_path": upload.final_path })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    require_upload_access(&state, &identity, &id)?;
    let status = state.uploads.status(&id)?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}
