use axum::http::{header, HeaderMap, Method};

use crate::dub_core::auth::{looks_like_api_key, Identity};

use super::error::ApiError;
use super::AppState;

/// Pull a named cookie out of the Cookie header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let rest = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let trimmed = rest.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Best-effort client address for rate limiting; honors the first
/// X-Forwarded-For hop when a proxy fronts the service.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Resolve the caller's identity, in credential order: API key, bearer
/// access token, session cookie.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        return Ok(state.auth.identity_from_api_key(key)?);
    }

    if let Some(token) = bearer_token(headers) {
        if looks_like_api_key(&token) {
            return Ok(state.auth.identity_from_api_key(&token)?);
        }
        return Ok(state.auth.identity_from_bearer(&token)?);
    }

    if let Some(session) = cookie_value(headers, "session") {
        return Ok(state.auth.identity_from_session(&session)?);
    }

    Err(ApiError::Unauthorized)
}

/// CSRF double-submit for state-changing requests.
///
/// Applies when the request authenticated via cookies (API keys and bearer
/// tokens are immune to cross-site form posts) and arrives with browser
/// provenance: an Origin header or a session/refresh cookie.
pub fn enforce_csrf(
    state: &AppState,
    headers: &HeaderMap,
    method: &Method,
    identity: &Identity,
) -> Result<(), ApiError> {
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(());
    }
    if identity.bypasses_csrf() {
        return Ok(());
    }
    let browser_provenance = headers.contains_key(header::ORIGIN)
        || cookie_value(headers, "session").is_some()
        || cookie_value(headers, "refresh").is_some();
    if !browser_provenance {
        return Ok(());
    }

    let cookie = cookie_value(headers, "csrf").unwrap_or_default();
    let header = headers
        .get("x-csrf-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    state.auth.verify_csrf(&cookie, header)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "session=abc; csrf=def; refresh=ghi".parse().unwrap(),
        );
        assert_eq!(cookie_value(&headers, "session").as_deref(), Some("abc"));
        assert_eq!(cookie_value(&headers, "csrf").as_deref(), Some("def"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok123"));

        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        assert_eq!(client_ip(&headers), "1.2.3.4");
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }
}
