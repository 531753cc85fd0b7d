use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::dub_core::audit::EventCtx;
use crate::dub_core::auth::{mint_api_key, TokenBundle};
use crate::dub_core::domain::Role;

use super::error::ApiError;
use super::extract::{authenticate, client_ip, cookie_value, enforce_csrf, request_id};
use super::{build_cookie, AppState};

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

fn token_response(state: &AppState, bundle: &TokenBundle) -> Response {
    let refresh_ttl = (state.settings.refresh_token_days as i64) * 86_400;
    let mut headers = HeaderMap::new();
    for cookie in [
        build_cookie(state, "session", &bundle.session_cookie, true, refresh_ttl),
        build_cookie(state, "refresh", &bundle.refresh_token, true, refresh_ttl),
        build_cookie(state, "csrf", &bundle.csrf_token, false, refresh_ttl),
    ] {
        if let Ok(value) = cookie.parse() {
            headers.append(header::SET_COOKIE, value);
        }
    }
    let body = Json(json!({
        "access_token": bundle.access_token,
        "token_type": "bearer",
        "csrf_token": bundle.csrf_token,
        "user_id": bundle.user_id,
        "role": bundle.role,
    }));
    (headers, body).into_response()
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LoginBody>,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers);
    let rid = request_id(&headers);
    match state.auth.login(&body.username, &body.password, &ip) {
        Ok(bundle) => {
            state.audit.event(
                "auth.login_ok",
                "success",
                EventCtx::default().user(bundle.user_id.clone()).request(rid),
            );
            Ok(token_response(&state, &bundle))
        }
        Err(err) => {
            state.audit.event(
                "auth.login_failed",
                "failure",
                EventCtx::default()
                    .request(rid)
                    .meta(json!({ "username": body.username })),
            );
            Err(err.into())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshBody {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<RefreshBody>>,
) -> Result<Response, ApiError> {
    let presented = body
        .and_then(|Json(body)| body.refresh_token)
        .or_else(|| cookie_value(&headers, "refresh"))
        .ok_or(ApiError::Unauthorized)?;
    let bundle = state.auth.rotate_refresh(&presented)?;
    state.audit.event(
        "auth.refresh_ok",
        "success",
        EventCtx::default()
            .user(bundle.user_id.clone())
            .request(request_id(&headers)),
    );
    Ok(token_response(&state, &bundle))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(refresh) = cookie_value(&headers, "refresh") {
        let _ = state.auth.logout(&refresh);
    }
    let mut response_headers = HeaderMap::new();
    for name in ["session", "refresh", "csrf"] {
        if let Ok(value) = build_cookie(&state, name, "", name != "csrf", 0).parse() {
            response_headers.append(header::SET_COOKIE, value);
        }
    }
    Ok((response_headers, Json(json!({ "ok": true }))).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateInviteBody {
    #[serde(default)]
    pub ttl_s: Option<i64>,
}

pub async fn create_invite(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CreateInviteBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;
    identity.require_role(Role::Admin)?;

    let ttl = body
        .and_then(|Json(body)| body.ttl_s)
        .unwrap_or(7 * 86_400);
    let token = state.auth.create_invite(&identity.user_id, ttl)?;
    Ok(Json(json!({ "invite_token": token, "ttl_s": ttl })))
}

#[derive(Debug, Deserialize)]
pub struct RedeemBody {
    pub token: String,
    pub username: String,
    pub password: String,
}

pub async fn redeem_invite(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RedeemBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let ip = client_ip(&headers);
    let user = state
        .auth
        .redeem_invite(&body.token, &body.username, &body.password, &ip)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "user_id": user.id, "username": user.username, "role": user.role })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub scopes: Vec<String>,
}

const KNOWN_SCOPES: &[&str] = &["read:job", "submit:job", "edit:job", "admin:*"];

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let identity = authenticate(&state, &headers)?;
    enforce_csrf(&state, &headers, &Method::POST, &identity)?;

    for scope in &body.scopes {
        if !KNOWN_SCOPES.contains(&scope.as_str()) {
            return Err(ApiError::BadRequest(format!("unsupported scope '{scope}'")));
        }
        if scope == "admin:*" && !identity.is_admin() {
            return Err(ApiError::Forbidden("forbidden"));
        }
    }

    let minted = mint_api_key(&identity.user_id, body.scopes);
    state
        .auth
        .store()
        .put_api_key(&minted.record)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": minted.record.id,
            "prefix": minted.record.prefix,
            "scopes": minted.record.scopes,
            // The plaintext is shown exactly once.
            "api_key": minted.plaintext,
        })),
    ))
}

pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let keys = state
        .auth
        .store()
        .list_api_keys_for_user(&identity.user_id)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(json!({ "keys": keys })))
}
