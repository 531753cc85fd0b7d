use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::dub_core::domain::Role;
use crate::dub_core::hashing::random_id;

use super::AuthError;

/// JWT claims shared by access and refresh tokens; `typ` disambiguates so a
/// refresh token can never be replayed as an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub typ: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn create_access_token(
    secret: &str,
    sub: &str,
    role: Role,
    scopes: &[String],
    minutes: u64,
) -> Result<String, AuthError> {
    let now = now_ts();
    let claims = Claims {
        typ: "access".to_string(),
        sub: sub.to_string(),
        role: Some(role.as_str().to_string()),
        scopes: scopes.to_vec(),
        iat: now,
        exp: now + (minutes as i64) * 60,
        jti: None,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidCredential)
}

pub fn create_refresh_token(secret: &str, sub: &str, days: u64) -> Result<String, AuthError> {
    let now = now_ts();
    let claims = Claims {
        typ: "refresh".to_string(),
        sub: sub.to_string(),
        role: None,
        scopes: Vec::new(),
        iat: now,
        exp: now + (days as i64) * 86_400,
        jti: Some(random_id("r_", 16)),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidCredential)
}

/// Decode and verify a token, requiring the expected `typ` claim.
pub fn decode_token(secret: &str, token: &str, expected_typ: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    // `sub` carries the identity; there is no audience in this deployment.
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AuthError::InvalidCredential)?;

    if data.claims.typ != expected_typ {
        return Err(AuthError::InvalidCredential);
    }
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn access_token_round_trips_role_and_scopes() {
        let token = create_access_token(
            SECRET,
            "u1",
            Role::Editor,
            &["submit:job".to_string()],
            15,
        )
        .unwrap();
        let claims = decode_token(SECRET, &token, "access").unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role.as_deref(), Some("editor"));
        assert_eq!(claims.scopes, vec!["submit:job"]);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn refresh_token_is_rejected_where_access_is_expected() {
        let token = create_refresh_token(SECRET, "u1", 7).unwrap();
        assert!(decode_token(SECRET, &token, "access").is_err());
        let claims = decode_token(SECRET, &token, "refresh").unwrap();
        assert!(claims.jti.as_deref().unwrap_or("").starts_with("r_"));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = create_access_token(SECRET, "u1", Role::Viewer, &[], 15).unwrap();
        assert!(decode_token("other-secret", &token, "access").is_err());
    }
}
