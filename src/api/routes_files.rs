use std::io::SeekFrom;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::dub_core::audit::EventCtx;
use crate::dub_core::auth::visibility::{can_view_job, job_for_artifact_path};
use crate::dub_core::paths::{resolve_under_root, verify_resolved_under_root};

use super::error::ApiError;
use super::extract::{authenticate, request_id};
use super::range::{parse_range, RangeOutcome};
use super::AppState;

const STREAM_CHUNK_BYTES: usize = 1024 * 1024;

fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("mkv") => "video/x-matroska",
        Some("mp4") => "video/mp4",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("srt") => "application/x-subrip",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("json") | Some("jsonl") => "application/json",
        Some("txt") | Some("log") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// `GET /files/{rel_path}`: resolve under the output root, enforce the
/// enclosing job's visibility, then stream with full Range support.
pub async fn serve(
    State(state): State<Arc<AppState>>,
    Path(rel_path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = authenticate(&state, &headers)?;

    let candidate = resolve_under_root(&state.layout.output_root, &rel_path)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if !candidate.exists() {
        return Err(ApiError::NotFound);
    }
    let resolved = verify_resolved_under_root(&state.layout.output_root, &candidate)
        .map_err(|_| ApiError::Forbidden("path"))?;
    if resolved.is_dir() {
        return Err(ApiError::NotFound);
    }

    // Access follows the visibility of the job that owns the artifact.
    let job = job_for_artifact_path(&state.jobs, &resolved)?.ok_or(ApiError::NotFound)?;
    if !can_view_job(&identity, &job) {
        return Err(ApiError::Forbidden("forbidden"));
    }

    let mut file = tokio::fs::File::open(&resolved)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .len();

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let outcome = parse_range(range_header, size);

    state.audit.event(
        "file.download",
        "success",
        EventCtx::default()
            .user(identity.user_id.clone())
            .job(job.id.clone())
            .request(request_id(&headers))
            .meta(json!({ "bytes": size, "ranged": !matches!(outcome, RangeOutcome::Full) })),
    );

    let content_type = content_type_for(&resolved);
    match outcome {
        RangeOutcome::Full => {
            let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_BYTES);
            let mut response = Response::new(Body::from_stream(stream));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
            headers.insert(header::CONTENT_LENGTH, size.into());
            headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
            Ok(response)
        }
        RangeOutcome::Partial(range) => {
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            let limited = file.take(range.len());
            let stream = ReaderStream::with_capacity(limited, STREAM_CHUNK_BYTES);
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
            headers.insert(header::CONTENT_LENGTH, range.len().into());
            headers.insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, size)
                    .parse()
                    .unwrap(),
            );
            headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
            Ok(response)
        }
        RangeOutcome::Unsatisfiable => {
            let mut response = ApiError::RangeNotSatisfiable.into_response();
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{size}").parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
            Ok(response)
        }
    }
}
