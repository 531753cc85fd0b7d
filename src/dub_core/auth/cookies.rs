use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::dub_core::hashing::random_id;

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn verify_signature(secret: &str, payload: &str, signature: &str) -> bool {
    let expected = sign(secret, payload);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Mint a signed session cookie value: `<user_id>.<exp>.<sig>`.
pub fn issue_session_cookie(secret: &str, user_id: &str, ttl_s: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + ttl_s;
    let payload = format!("{user_id}.{exp}");
    let sig = sign(secret, &payload);
    format!("{payload}.{sig}")
}

/// Verify a session cookie and return the user id it names.
pub fn verify_session_cookie(secret: &str, value: &str) -> Result<String, AuthError> {
    let mut parts = value.rsplitn(2, '.');
    let sig = parts.next().ok_or(AuthError::InvalidCredential)?;
    let payload = parts.next().ok_or(AuthError::InvalidCredential)?;
    if !verify_signature(secret, payload, sig) {
        return Err(AuthError::InvalidCredential);
    }
    let (user_id, exp_raw) = payload.rsplit_once('.').ok_or(AuthError::InvalidCredential)?;
    let exp: i64 = exp_raw.parse().map_err(|_| AuthError::InvalidCredential)?;
    if chrono::Utc::now().timestamp() > exp {
        return Err(AuthError::InvalidCredential);
    }
    if user_id.is_empty() {
        return Err(AuthError::InvalidCredential);
    }
    Ok(user_id.to_string())
}

/// Signed CSRF token for the double-submit check: `<nonce>.<sig>`.
pub fn issue_csrf_token(secret: &str) -> String {
    let nonce = random_id("c_", 16);
    let sig = sign(secret, &nonce);
    format!("{nonce}.{sig}")
}

pub fn verify_csrf_token(secret: &str, value: &str) -> bool {
    match value.rsplit_once('.') {
        Some((nonce, sig)) => verify_signature(secret, nonce, sig),
        None => false,
    }
}

/// Double-submit CSRF check: the header must echo the cookie and the cookie
/// must carry a valid signature.
pub fn verify_csrf_pair(secret: &str, cookie: &str, header: &str) -> Result<(), AuthError> {
    if cookie.is_empty() || header.is_empty() {
        return Err(AuthError::CsrfRequired);
    }
    let matches: bool = cookie.as_bytes().ct_eq(header.as_bytes()).into();
    if !matches || !verify_csrf_token(secret, cookie) {
        return Err(AuthError::CsrfInvalid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "cookie-secret";

    #[test]
    fn session_cookie_round_trips_user_id() {
        let cookie = issue_session_cookie(SECRET, "u1", 3600);
        assert_eq!(verify_session_cookie(SECRET, &cookie).unwrap(), "u1");
    }

    #[test]
    fn tampered_session_cookie_is_rejected() {
        let cookie = issue_session_cookie(SECRET, "u1", 3600);
        let forged = cookie.replacen("u1", "u2", 1);
        assert!(verify_session_cookie(SECRET, &forged).is_err());
        assert!(verify_session_cookie("other", &cookie).is_err());
    }

    #[test]
    fn expired_session_cookie_is_rejected() {
        let cookie = issue_session_cookie(SECRET, "u1", -10);
        assert!(verify_session_cookie(SECRET, &cookie).is_err());
    }

    #[test]
    fn csrf_pair_requires_matching_signed_values() {
        let token = issue_csrf_token(SECRET);
        assert!(verify_csrf_pair(SECRET, &token, &token).is_ok());

        let err = verify_csrf_pair(SECRET, &token, "different").unwrap_err();
        assert!(matches!(err, AuthError::CsrfInvalid));

        let err = verify_csrf_pair(SECRET, "", "").unwrap_err();
        assert!(matches!(err, AuthError::CsrfRequired));

        let unsigned = "c_nonsense.badsig";
        let err = verify_csrf_pair(SECRET, unsigned, unsigned).unwrap_err();
        assert!(matches!(err, AuthError::CsrfInvalid));
    }
}
