use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::dub_core::auth::AuthError;
use crate::dub_core::engine::EngineError;
use crate::dub_core::quotas::QuotaError;
use crate::dub_core::store::StoreError;
use crate::dub_core::uploads::UploadError;

/// HTTP error taxonomy. Every handler error maps through here so status
/// codes and `{detail, reason?}` bodies stay consistent, and stack traces
/// never leak to clients.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden(&'static str),
    RateLimited,
    NotFound,
    Conflict(String),
    PayloadTooLarge,
    QuotaExceeded(String),
    InsufficientStorage,
    RangeNotSatisfiable,
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited | ApiError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::BadRequest(detail) => detail.clone(),
            ApiError::Unauthorized => "authentication required".to_string(),
            ApiError::Forbidden(_) => "forbidden".to_string(),
            ApiError::RateLimited => "rate limited".to_string(),
            ApiError::NotFound => "not found".to_string(),
            ApiError::Conflict(detail) => detail.clone(),
            ApiError::PayloadTooLarge => "payload too large".to_string(),
            ApiError::QuotaExceeded(detail) => detail.clone(),
            ApiError::InsufficientStorage => "insufficient storage".to_string(),
            ApiError::RangeNotSatisfiable => "range not satisfiable".to_string(),
            // Internal details go to the app log only; clients get an id.
            ApiError::Internal(_) => "internal error".to_string(),
        }
    }

    fn reason(&self) -> Option<&'static str> {
        match self {
            ApiError::Forbidden(reason) => Some(reason),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            let error_id = uuid::Uuid::new_v4().to_string();
            tracing::error!(error_id = %error_id, detail = %detail, "internal error");
            let body = json!({ "detail": "internal error", "error_id": error_id });
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
        let mut body = json!({ "detail": self.detail() });
        if let Some(reason) = self.reason() {
            body["reason"] = json!(reason);
        }
        (self.status(), Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential | AuthError::Replay => ApiError::Unauthorized,
            AuthError::Forbidden => ApiError::Forbidden("forbidden"),
            AuthError::CsrfRequired | AuthError::CsrfInvalid => ApiError::Forbidden("csrf"),
            AuthError::RateLimited => ApiError::RateLimited,
            AuthError::Conflict(detail) => ApiError::Conflict(detail),
            AuthError::Internal => ApiError::Internal("auth service failure".to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict(detail) => ApiError::Conflict(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::UploadTooLarge => ApiError::PayloadTooLarge,
            QuotaError::DiskFull => ApiError::InsufficientStorage,
            QuotaError::Internal => ApiError::Internal("quota lookup failed".to_string()),
            other => ApiError::QuotaExceeded(other.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidFilename(detail) => ApiError::BadRequest(detail),
            UploadError::TooLarge => ApiError::PayloadTooLarge,
            UploadError::NotFound => ApiError::NotFound,
            UploadError::Quota(quota) => quota.into(),
            UploadError::Io(detail) => ApiError::Internal(detail),
            UploadError::Internal => ApiError::Internal("upload lookup failed".to_string()),
            conflict => ApiError::Conflict(conflict.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound => ApiError::NotFound,
            EngineError::Conflict(detail) => ApiError::Conflict(detail),
            EngineError::Store(detail) => ApiError::Internal(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrf_failures_are_403_with_a_distinct_reason() {
        let err: ApiError = AuthError::CsrfInvalid.into();
        assert!(matches!(err, ApiError::Forbidden("csrf")));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn quota_errors_split_into_413_429_507() {
        assert_eq!(
            ApiError::from(QuotaError::UploadTooLarge).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from(QuotaError::JobsPerDayExceeded).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(QuotaError::DiskFull).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }

    #[test]
    fn upload_conflicts_map_to_409() {
        let err: ApiError = UploadError::HashMismatch.into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        let err: ApiError = UploadError::ChunkOutOfOrder { expected: 2 }.into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn replay_maps_to_401() {
        assert_eq!(ApiError::from(AuthError::Replay).status(), StatusCode::UNAUTHORIZED);
    }
}
