use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::dub_core::domain::Role;
use crate::dub_core::store::JobFilter;

use super::error::ApiError;
use super::extract::{authenticate, enforce_csrf};
use super::AppState;

fn viewer_scope(identity: &crate::dub_core::auth::Identity) -> Option<String> {
    (!identity.is_admin()).then(|| identity.user_id.clone())
}

pub async fn series(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let series = state.jobs.list_series(viewer_scope(&identity))?;
    Ok(Json(json!({ "series": series })))
}

pub async fn seasons(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let viewer = viewer_scope(&identity);

    let seasons = state.jobs.list_seasons(&series, viewer.clone())?;
    if seasons.is_empty() {
        // Distinguish "does not exist" from "exists but not yours".
        if state.jobs.series_exists(&series)? {
            return Err(ApiError::Forbidden("forbidden"));
        }
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "series": series, "seasons": seasons })))
}

pub async fn episodes(
    State(state): State<Arc<AppState>>,
    Path((series, season)): Path<(String, u32)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let viewer = viewer_scope(&identity);

    let episodes = state.jobs.list_episodes(&series, season, viewer)?;
    if episodes.is_empty() {
        if state.jobs.series_exists(&series)? {
            return Err(ApiError::Forbidden("forbidden"));
        }
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({
        "series": series,
        "season": season,
        "episodes": episodes,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let results = state.jobs.search_library(
        &query.q,
        viewer_scope(&identity),
        query.limit.unwrap_or(50).min(200),
    )?;
    Ok(Json(json!({ "results": results })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let jobs = state.jobs.list_jobs(&JobFilter {
        state: Some(crate::dub_core::domain::JobState::Done),
        viewer_id: viewer_scope(&identity),
        limit: query.limit.unwrap_or(20).min(100),
        ..Default::default()
    })?;
    let recent: Vec<_> = jobs
        .iter()
        .filter(|job| !job.series_slug.is_empty())
        .map(|job| {
            json!({
                "job_id": job.id,
                "series_title": job.series_title,
                "series_slug": job.series_slug,
                "season_number": job.season_number,
                "episode_number": job.episode_number,
                "created_at": job.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "recent": recent })))
}

pub async fn continue_watching(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let rows = state.jobs.continue_watching(&identity.user_id, 20)?;
    Ok(Json(json!({ "continue": rows })))
}

pub async fn voices(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    if !state.jobs.series_visible(&series, viewer_scope(&identity))? {
        return Err(if state.jobs.series_exists(&series)? {
            ApiError::Forbidden("forbidden")
        } else {
            ApiError::NotFound
        });
    }
    let voices = state.jobs.list_voice_profiles(&series)?;
    Ok(Json(json!({ "series": series, "voices": voices })))
}

#[derive(Debug, Deserialize)]
pub struct AddVoiceBody {
    pub character_name: String,
    pub ref_audio_path: String,
}

pub async fn add_voice(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AddVoiceBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    identity.require_role(Role::Editor)?;
    if body.character_name.trim().is_empty() {
        return Err(ApiError::BadRequest("character_name required".to_string()));
    }

    let profile = state.jobs.append_voice_profile(
        &series,
        body.character_name.trim(),
        &body.ref_audio_path,
        &identity.user_id,
    )?;
    Ok(Json(json!({ "ok": true, "voice": profile })))
}
