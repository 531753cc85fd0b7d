use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::dub_core::audit::EventCtx;
use crate::dub_core::domain::{Role, Visibility};
use crate::dub_core::engine::backend_mode_name;

use super::error::ApiError;
use super::extract::{authenticate, enforce_csrf, request_id};
use super::AppState;

fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    method: Method,
) -> Result<crate::dub_core::auth::Identity, ApiError> {
    let identity = authenticate(state, headers)?;
    enforce_csrf(state, headers, &method, &identity)?;
    identity.require_role(Role::Admin)?;
    Ok(identity)
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn queue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = require_admin(&state, &headers, Method::GET)?;
    let snapshot = state.engine.snapshot_queue(query.limit.unwrap_or(100));
    state.audit.event(
        "admin.queue_view",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .request(request_id(&headers)),
    );
    Ok(Json(json!({
        "queue": snapshot,
        "scheduler": state.engine.scheduler_state(),
    })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _identity = require_admin(&state, &headers, Method::GET)?;
    let backend = state.engine.queue_backend_status();
    Ok(Json(json!({
        "scheduler": state.engine.scheduler_state(),
        "queue_backend": {
            "mode": backend_mode_name(&backend),
            "detail": backend,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct PriorityBody {
    pub priority: u32,
}

pub async fn priority(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PriorityBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = require_admin(&state, &headers, Method::POST)?;
    let changed = state.engine.reprioritize(&id, body.priority);
    if !changed {
        return Err(ApiError::Conflict("job is not queued".to_string()));
    }
    state.audit.event(
        "admin.job_priority",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(id.clone())
            .request(request_id(&headers))
            .meta(json!({ "priority": body.priority })),
    );
    Ok(Json(json!({ "ok": true, "priority": body.priority })))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = require_admin(&state, &headers, Method::POST)?;
    let changed = state.engine.cancel_job(&id);
    state.audit.event(
        "admin.job_cancel",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(id.clone())
            .request(request_id(&headers)),
    );
    Ok(Json(json!({ "ok": true, "changed": changed })))
}

#[derive(Debug, Deserialize)]
pub struct VisibilityBody {
    pub visibility: String,
}

pub async fn visibility(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<VisibilityBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = require_admin(&state, &headers, Method::POST)?;
    let visibility = Visibility::parse(&body.visibility)
        .ok_or_else(|| ApiError::BadRequest(format!("bad visibility '{}'", body.visibility)))?;
    let updated = state.jobs.update_job(&id, |row| {
        row.visibility = visibility;
    })?;
    state.audit.event(
        "admin.job_visibility",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(id)
            .request(request_id(&headers))
            .meta(json!({ "visibility": visibility.as_str() })),
    );
    Ok(Json(json!({ "ok": true, "visibility": updated.visibility })))
}
