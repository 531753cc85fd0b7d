use std::convert::Infallible;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::dub_core::audit::EventCtx;
use crate::dub_core::auth::visibility::{can_mutate, can_view_job};
use crate::dub_core::checkpoint::{self, checkpoint_path};
use crate::dub_core::domain::{
    DevicePref, Job, JobMode, JobState, QaReview, ReviewStatus, Role, ViewRecord, Visibility,
};
use crate::dub_core::engine::DEFAULT_JOB_PRIORITY;
use crate::dub_core::job_logs::tail_log;
use crate::dub_core::library::job_file_urls;
use crate::dub_core::store::JobFilter;

use super::error::ApiError;
use super::extract::{authenticate, enforce_csrf, request_id};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    pub upload_id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    pub src_lang: String,
    pub tgt_lang: String,
    #[serde(default)]
    pub series_title: Option<String>,
    #[serde(default)]
    pub season_number: Option<u32>,
    #[serde(default)]
    pub episode_number: Option<u32>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    /// Optional path to user-supplied target-language subtitles; skips the
    /// asr and translation stages.
    #[serde(default)]
    pub imported_srt: Option<String>,
}

fn load_job(state: &AppState, id: &str) -> Result<Job, ApiError> {
    state.jobs.get_job(id)?.ok_or(ApiError::NotFound)
}

fn viewable_job(
    state: &AppState,
    identity: &crate::dub_core::auth::Identity,
    id: &str,
) -> Result<Job, ApiError> {
    let job = load_job(state, id)?;
    if !can_view_job(identity, &job) {
        return Err(ApiError::Forbidden("forbidden"));
    }
    Ok(job)
}

fn mutable_job(
    state: &AppState,
    identity: &crate::dub_core::auth::Identity,
    id: &str,
) -> Result<Job, ApiError> {
    let job = load_job(state, id)?;
    if !can_mutate(identity, &job.owner_id) {
        return Err(ApiError::Forbidden("forbidden"));
    }
    Ok(job)
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateJobBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    identity.require_role(Role::Operator)?;
    identity.require_scope("submit:job")?;
    state.quotas.check_job_create(&identity.user_id)?;

    let upload = state.uploads.get(&body.upload_id)?;
    if !can_mutate(&identity, &upload.owner_id) {
        return Err(ApiError::Forbidden("forbidden"));
    }
    if !upload.completed {
        return Err(ApiError::Conflict("upload is not complete".to_string()));
    }

    let mode = body
        .mode
        .as_deref()
        .map(|raw| JobMode::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("bad mode '{raw}'"))))
        .transpose()?
        .unwrap_or(JobMode::Medium);
    let device = body
        .device
        .as_deref()
        .map(|raw| {
            DevicePref::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("bad device '{raw}'")))
        })
        .transpose()?
        .unwrap_or(DevicePref::Auto);
    let visibility = body
        .visibility
        .as_deref()
        .map(|raw| {
            Visibility::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("bad visibility '{raw}'")))
        })
        .transpose()?
        .unwrap_or(Visibility::Private);

    let series_title = body.series_title.unwrap_or_default();
    let series_slug = crate::dub_core::paths::slugify(&series_title);
    let priority = body.priority.unwrap_or(DEFAULT_JOB_PRIORITY);

    let mut runtime = std::collections::BTreeMap::new();
    runtime.insert("priority".to_string(), json!(priority));
    if let Some(imported) = &body.imported_srt {
        runtime.insert("imported_srt".to_string(), json!(imported));
    }

    let job = Job {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: identity.user_id.clone(),
        video_path: upload.final_path.clone(),
        duration_s: 0.0,
        mode,
        device,
        src_lang: body.src_lang,
        tgt_lang: body.tgt_lang,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        state: JobState::Queued,
        progress: 0.0,
        message: "Queued".to_string(),
        output_mkv: None,
        output_srt: None,
        work_dir: String::new(),
        log_path: String::new(),
        error: None,
        series_title,
        series_slug,
        season_number: body.season_number.unwrap_or(0),
        episode_number: body.episode_number.unwrap_or(0),
        visibility,
        runtime,
    };
    state.jobs.put_job(&job)?;
    state.metrics.pipeline_job_total.inc();
    state.engine.submit_job(&job, priority);

    state.audit.event(
        "job.create",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(job.id.clone())
            .request(request_id(&headers))
            .meta(json!({ "mode": job.mode.as_str(), "device": job.device.as_str() })),
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": job.id, "state": job.state, "priority": priority })),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let filter = JobFilter {
        state: query.state.as_deref().and_then(JobState::parse),
        q: query.q,
        mode: query.mode.as_deref().and_then(JobMode::parse),
        series_slug: query.project,
        viewer_id: (!identity.is_admin()).then(|| identity.user_id.clone()),
        limit: query.limit.unwrap_or(50).min(500),
        offset: query.offset.unwrap_or(0),
    };
    let jobs = state.jobs.list_jobs(&filter)?;
    Ok(Json(json!({ "jobs": jobs, "count": jobs.len() })))
}

fn checkpoint_summary(job: &Job) -> serde_json::Value {
    if job.work_dir.is_empty() {
        return json!(null);
    }
    let path = checkpoint_path(FsPath::new(&job.work_dir));
    match checkpoint::read_checkpoint(&path, &job.id) {
        Some(ckpt) => {
            let done: Vec<&String> = ckpt
                .stages
                .iter()
                .filter(|(_, entry)| entry.done)
                .map(|(name, _)| name)
                .collect();
            json!({ "last_stage": ckpt.last_stage, "stages_done": done })
        }
        None => json!(null),
    }
}

pub async fn detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let job = viewable_job(&state, &identity, &id)?;

    // Opening an episode bumps the viewer's continue-watching row.
    if !job.series_slug.is_empty() {
        let _ = state.jobs.record_view(&ViewRecord {
            user_id: identity.user_id.clone(),
            series_slug: job.series_slug.clone(),
            season_number: job.season_number,
            episode_number: job.episode_number,
            job_id: job.id.clone(),
            last_opened_at: Utc::now(),
        });
    }

    let mut body = serde_json::to_value(&job).unwrap_or_default();
    body["checkpoint"] = checkpoint_summary(&job);
    body["files"] = json!(job_file_urls(&state.layout, &job));
    body["degraded_reasons"] = json!(job.degraded_reasons());
    Ok(Json(body))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    let job = mutable_job(&state, &identity, &id)?;

    let changed = state.engine.cancel_job(&job.id);
    state.audit.event(
        "job.cancel",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(job.id.clone())
            .request(request_id(&headers)),
    );
    Ok(Json(json!({ "ok": true, "changed": changed })))
}

pub async fn pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    let job = mutable_job(&state, &identity, &id)?;
    state.engine.pause_job(&job.id)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    let job = mutable_job(&state, &identity, &id)?;
    state.engine.resume_job(&job.id)?;
    Ok(Json(json!({ "ok": true })))
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
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    let job = mutable_job(&state, &identity, &id)?;

    let visibility = Visibility::parse(&body.visibility)
        .ok_or_else(|| ApiError::BadRequest(format!("bad visibility '{}'", body.visibility)))?;
    let updated = state.jobs.update_job(&job.id, |row| {
        row.visibility = visibility;
    })?;

    state.audit.event(
        "job.visibility",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(job.id.clone())
            .request(request_id(&headers))
            .meta(json!({ "visibility": visibility.as_str() })),
    );
    Ok(Json(json!({ "ok": true, "visibility": updated.visibility })))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::DELETE, &identity)?;
    let job = mutable_job(&state, &identity, &id)?;

    // Cascade artifact deletion, restricted to the output root; a path that
    // resolves elsewhere is skipped, never force-removed.
    if !job.work_dir.is_empty() {
        let work_dir = PathBuf::from(&job.work_dir);
        let output_dir = work_dir.parent().unwrap_or(&work_dir).to_path_buf();
        if let (Ok(root), Ok(target)) = (
            state.layout.output_root.canonicalize(),
            output_dir.canonicalize(),
        ) {
            if target.starts_with(&root) && target != root {
                let _ = std::fs::remove_dir_all(&target);
            } else {
                tracing::warn!(job_id = %job.id, "refused artifact cascade outside output root");
            }
        }
        let library_dir = state.layout.library_episode_dir(
            &job.series_slug,
            job.season_number,
            job.episode_number,
            &job.id,
        );
        if !job.series_slug.is_empty() && library_dir.exists() {
            let _ = std::fs::remove_dir_all(&library_dir);
        }
    }

    state.engine.drop_job(&job.id);
    state.jobs.delete_job(&job.id)?;
    state.audit.event(
        "job.delete",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(job.id.clone())
            .request(request_id(&headers)),
    );
    Ok(Json(json!({ "ok": true })))
}

pub async fn files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let job = viewable_job(&state, &identity, &id)?;
    Ok(Json(json!({ "files": job_file_urls(&state.layout, &job) })))
}

#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    pub n: Option<usize>,
}

fn job_log_path(job: &Job) -> Option<PathBuf> {
    if !job.log_path.is_empty() {
        return Some(PathBuf::from(&job.log_path));
    }
    if job.work_dir.is_empty() {
        return None;
    }
    let work_dir = PathBuf::from(&job.work_dir);
    Some(work_dir.parent()?.join("logs").join("pipeline.log"))
}

pub async fn logs_tail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let job = viewable_job(&state, &identity, &id)?;
    let n = query.n.unwrap_or(200).min(5_000);
    let tail = job_log_path(&job)
        .map(|path| tail_log(&path, n))
        .unwrap_or_default();
    Ok(Json(json!({ "job_id": job.id, "tail": tail })))
}

/// Server-sent events over the per-job log: replays the current tail, then
/// follows appends, polling once a second.
pub async fn logs_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let job = viewable_job(&state, &identity, &id)?;
    let path = job_log_path(&job).ok_or(ApiError::NotFound)?;

    let stream = futures::stream::unfold(0u64, move |mut offset| {
        let path = path.clone();
        async move {
            loop {
                let chunk = tokio::task::spawn_blocking({
                    let path = path.clone();
                    move || read_from_offset(&path, offset)
                })
                .await
                .unwrap_or_default();
                if !chunk.is_empty() {
                    offset += chunk.len() as u64;
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    return Some((Ok(Event::default().data(text)), offset));
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn read_from_offset(path: &FsPath, offset: u64) -> Vec<u8> {
    use std::io::{Read, Seek, SeekFrom};
    let Ok(mut file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return Vec::new();
    }
    let mut buf = Vec::new();
    let _ = file.take(256 * 1024).read_to_end(&mut buf);
    buf
}

// ---- QA reviews -------------------------------------------------------------

pub async fn qa_list(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let job = viewable_job(&state, &identity, &id)?;
    let reviews = state.jobs.list_qa_reviews(&job.id)?;
    Ok(Json(json!({ "job_id": job.id, "reviews": reviews })))
}

#[derive(Debug, Deserialize)]
pub struct QaBody {
    pub segment_id: String,
    pub status: String,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn qa_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<QaBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    identity.require_role(Role::Editor)?;
    let job = viewable_job(&state, &identity, &id)?;

    let status = ReviewStatus::parse(&body.status)
        .ok_or_else(|| ApiError::BadRequest(format!("bad review status '{}'", body.status)))?;
    let review = QaReview {
        job_id: job.id.clone(),
        segment_id: body.segment_id,
        status,
        note: body.note,
        updated_by: identity.user_id.clone(),
        updated_at: Utc::now(),
    };
    state.jobs.upsert_qa_review(&review)?;
    Ok(Json(json!({ "ok": true, "review": review })))
}
