//! Identity and authorization: credential resolution, refresh rotation with
//! replay detection, RBAC + scopes, CSRF, rate limiting, invites.

mod api_keys;
mod cookies;
mod password;
mod rate_limit;
mod tokens;
pub mod visibility;

use std::sync::Arc;

use chrono::Utc;

use crate::dub_core::domain::{InviteRecord, RefreshTokenRecord, Role, User};
use crate::dub_core::hashing::{random_id, sha256_hex};
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::AuthStore;

pub use api_keys::{looks_like_api_key, mint_api_key, verify_api_key, MintedApiKey};
pub use cookies::{
    issue_csrf_token, issue_session_cookie, verify_csrf_pair, verify_session_cookie,
};
pub use password::{hash_password, verify_password};
pub use rate_limit::RateLimiter;
pub use tokens::{create_access_token, create_refresh_token, decode_token, Claims};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("forbidden")]
    Forbidden,
    #[error("CSRF token required")]
    CsrfRequired,
    #[error("CSRF token invalid")]
    CsrfInvalid,
    #[error("rate limited")]
    RateLimited,
    #[error("refresh token replay detected")]
    Replay,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal auth error")]
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    ApiKey,
    Bearer,
    Session,
}

/// Resolved caller identity, attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub scopes: Vec<String>,
    pub kind: CredentialKind,
}

/// Scopes a human session implicitly carries, by role. API keys carry their
/// own explicit scope set instead.
fn implicit_scopes(role: Role) -> Vec<String> {
    let mut scopes = vec!["read:job".to_string()];
    if role >= Role::Operator {
        scopes.push("submit:job".to_string());
    }
    if role >= Role::Editor {
        scopes.push("edit:job".to_string());
    }
    if role == Role::Admin {
        scopes.push("admin:*".to_string());
    }
    scopes
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_role(&self, min: Role) -> Result<(), AuthError> {
        if self.role >= min {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.role == Role::Admin
            || self.scopes.iter().any(|s| s == scope || s == "admin:*")
    }

    pub fn require_scope(&self, scope: &str) -> Result<(), AuthError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    /// API keys authenticate per-request and carry no session state, so the
    /// CSRF double-submit does not apply to them.
    pub fn bypasses_csrf(&self) -> bool {
        self.kind == CredentialKind::ApiKey
    }
}

/// Tokens handed back by login and refresh.
#[derive(Debug, Clone)]
pub struct TokenBundle {
    pub user_id: String,
    pub role: Role,
    pub access_token: String,
    pub refresh_token: String,
    pub session_cookie: String,
    pub csrf_token: String,
}

/// Identity service over the auth store. Stateless apart from the store and
/// the in-memory rate limiter; built once in the composition root.
pub struct AuthService {
    store: Arc<AuthStore>,
    settings: Arc<AppSettings>,
    pub limiter: RateLimiter,
}

impl AuthService {
    pub fn new(store: Arc<AuthStore>, settings: Arc<AppSettings>) -> Self {
        Self {
            store,
            settings,
            limiter: RateLimiter::new(),
        }
    }

    pub fn store(&self) -> &AuthStore {
        &self.store
    }

    /// Create the initial admin from `ADMIN_USERNAME`/`ADMIN_PASSWORD` when
    /// the user table is empty. Safe to call on every startup.
    pub fn bootstrap_admin(&self) -> Result<Option<User>, AuthError> {
        if self.settings.admin_username.is_empty() || self.settings.admin_password.is_empty() {
            return Ok(None);
        }
        let count = self.store.count_users().map_err(|_| AuthError::Internal)?;
        if count > 0 {
            return Ok(None);
        }
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: self.settings.admin_username.clone(),
            password_hash: hash_password(&self.settings.admin_password)?,
            role: Role::Admin,
            totp_secret: None,
            created_at: Utc::now(),
        };
        self.store.create_user(&user).map_err(|_| AuthError::Internal)?;
        tracing::info!(username = %user.username, "bootstrapped admin user");
        Ok(Some(user))
    }

    fn issue_bundle(&self, user: &User) -> Result<TokenBundle, AuthError> {
        let refresh = self.issue_and_store_refresh(&user.id, None, None)?;
        self.issue_bundle_with_refresh(user, refresh)
    }

    fn issue_bundle_with_refresh(
        &self,
        user: &User,
        refresh: String,
    ) -> Result<TokenBundle, AuthError> {
        let access = create_access_token(
            &self.settings.jwt_secret,
            &user.id,
            user.role,
            &implicit_scopes(user.role),
            self.settings.access_token_minutes,
        )?;
        let session = issue_session_cookie(
            &self.settings.session_secret,
            &user.id,
            (self.settings.refresh_token_days as i64) * 86_400,
        );
        let csrf = issue_csrf_token(&self.settings.csrf_secret);
        Ok(TokenBundle {
            user_id: user.id.clone(),
            role: user.role,
            access_token: access,
            refresh_token: refresh,
            session_cookie: session,
            csrf_token: csrf,
        })
    }

    pub fn login(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<TokenBundle, AuthError> {
        if !self.limiter.allow("login", client_ip, 5, 60.0) {
            return Err(AuthError::RateLimited);
        }
        let user = self
            .store
            .get_user_by_username(username)
            .map_err(|_| AuthError::Internal)?
            .ok_or(AuthError::InvalidCredential)?;
        if !verify_password(password, &user.password_hash) {
            return Err(AuthError::InvalidCredential);
        }
        self.issue_bundle(&user)
    }

    fn issue_and_store_refresh(
        &self,
        user_id: &str,
        last_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<String, AuthError> {
        let token = create_refresh_token(
            &self.settings.jwt_secret,
            user_id,
            self.settings.refresh_token_days,
        )?;
        let claims = decode_token(&self.settings.jwt_secret, &token, "refresh")?;
        let jti = claims.jti.ok_or(AuthError::Internal)?;
        self.store
            .put_refresh_token(&RefreshTokenRecord {
                jti,
                user_id: user_id.to_string(),
                token_hash: sha256_hex(token.as_bytes()),
                expires_at: claims.exp,
                created_at: claims.iat,
                revoked: false,
                replaced_by: None,
                device_id: None,
                last_ip,
                user_agent,
            })
            .map_err(|_| AuthError::Internal)?;
        Ok(token)
    }

    /// Single-use refresh rotation.
    ///
    /// A revoked token with a successor is a replay; a stored-hash mismatch
    /// means the signed token was re-minted outside this service. Both revoke
    /// every live token for the user before failing.
    pub fn rotate_refresh(&self, presented: &str) -> Result<TokenBundle, AuthError> {
        let claims = decode_token(&self.settings.jwt_secret, presented, "refresh")?;
        let jti = claims.jti.clone().ok_or(AuthError::InvalidCredential)?;
        let sub = claims.sub.clone();
        if sub.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        let record = self
            .store
            .get_refresh_token(&jti)
            .map_err(|_| AuthError::Internal)?
            .ok_or(AuthError::InvalidCredential)?;

        if record.revoked {
            if record.replaced_by.is_some() {
                let _ = self.store.revoke_all_refresh_tokens_for_user(&sub);
                tracing::warn!(user_id = %sub, "refresh token replay; all sessions revoked");
                return Err(AuthError::Replay);
            }
            return Err(AuthError::InvalidCredential);
        }

        if record.token_hash != sha256_hex(presented.as_bytes()) {
            let _ = self.store.revoke_all_refresh_tokens_for_user(&sub);
            tracing::warn!(user_id = %sub, "refresh token hash mismatch; all sessions revoked");
            return Err(AuthError::Replay);
        }

        if record.expires_at > 0 && Utc::now().timestamp() > record.expires_at {
            let _ = self.store.revoke_refresh_token(&jti);
            return Err(AuthError::InvalidCredential);
        }

        let user = self
            .store
            .get_user(&sub)
            .map_err(|_| AuthError::Internal)?
            .ok_or(AuthError::InvalidCredential)?;

        let new_refresh = self.issue_and_store_refresh(&user.id, None, None)?;
        let new_claims = decode_token(&self.settings.jwt_secret, &new_refresh, "refresh")?;
        let new_jti = new_claims.jti.ok_or(AuthError::Internal)?;
        self.store
            .rotate_refresh_token(&jti, &new_jti)
            .map_err(|_| AuthError::Internal)?;

        self.issue_bundle_with_refresh(&user, new_refresh)
    }

    /// Best-effort revocation of the presented refresh token.
    pub fn logout(&self, presented: &str) -> Result<(), AuthError> {
        if let Ok(claims) = decode_token(&self.settings.jwt_secret, presented, "refresh") {
            if let Some(jti) = claims.jti {
                let _ = self.store.revoke_refresh_token(&jti);
            }
        }
        Ok(())
    }

    // ---- invites -----------------------------------------------------------

    pub fn create_invite(&self, created_by: &str, ttl_s: i64) -> Result<String, AuthError> {
        let token = random_id("inv_", 24);
        self.store
            .put_invite(&InviteRecord {
                token_hash: sha256_hex(token.as_bytes()),
                created_by: created_by.to_string(),
                expires_at: Utc::now().timestamp() + ttl_s.max(60),
                used_by: None,
            })
            .map_err(|_| AuthError::Internal)?;
        Ok(token)
    }

    pub fn redeem_invite(
        &self,
        token: &str,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<User, AuthError> {
        if !self.limiter.allow("invite_redeem", client_ip, 10, 60.0) {
            return Err(AuthError::RateLimited);
        }
        let token_prefix: String = token.chars().take(8).collect();
        if !self.limiter.allow("invite_redeem_token", &token_prefix, 5, 60.0) {
            return Err(AuthError::RateLimited);
        }

        let hash = sha256_hex(token.as_bytes());
        let invite = self
            .store
            .get_invite(&hash)
            .map_err(|_| AuthError::Internal)?
            .ok_or(AuthError::InvalidCredential)?;
        if invite.used_by.is_some() {
            return Err(AuthError::Conflict("invite already used".to_string()));
        }
        if Utc::now().timestamp() > invite.expires_at {
            return Err(AuthError::InvalidCredential);
        }
        if self
            .store
            .get_user_by_username(username)
            .map_err(|_| AuthError::Internal)?
            .is_some()
        {
            return Err(AuthError::Conflict("username taken".to_string()));
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash_password(password)?,
            role: Role::Operator,
            totp_secret: None,
            created_at: Utc::now(),
        };
        self.store.create_user(&user).map_err(|_| AuthError::Internal)?;
        self.store
            .mark_invite_used(&hash, &user.id)
            .map_err(|err| match err {
                crate::dub_core::store::StoreError::Conflict(msg) => AuthError::Conflict(msg),
                _ => AuthError::Internal,
            })?;
        Ok(user)
    }

    // ---- credential resolution ---------------------------------------------

    pub fn identity_from_api_key(&self, raw: &str) -> Result<Identity, AuthError> {
        let record = verify_api_key(&self.store, raw)?;
        let user = self
            .store
            .get_user(&record.user_id)
            .map_err(|_| AuthError::Internal)?
            .ok_or(AuthError::InvalidCredential)?;
        Ok(Identity {
            user_id: user.id,
            role: user.role,
            scopes: record.scopes,
            kind: CredentialKind::ApiKey,
        })
    }

    pub fn identity_from_bearer(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = decode_token(&self.settings.jwt_secret, token, "access")?;
        let role = claims
            .role
            .as_deref()
            .and_then(Role::parse)
            .unwrap_or(Role::Viewer);
        Ok(Identity {
            user_id: claims.sub,
            role,
            scopes: claims.scopes,
            kind: CredentialKind::Bearer,
        })
    }

    pub fn identity_from_session(&self, cookie_value: &str) -> Result<Identity, AuthError> {
        let user_id = verify_session_cookie(&self.settings.session_secret, cookie_value)?;
        let user = self
            .store
            .get_user(&user_id)
            .map_err(|_| AuthError::Internal)?
            .ok_or(AuthError::InvalidCredential)?;
        Ok(Identity {
            user_id: user.id,
            role: user.role,
            scopes: implicit_scopes(user.role),
            kind: CredentialKind::Session,
        })
    }

    pub fn verify_csrf(&self, cookie: &str, header: &str) -> Result<(), AuthError> {
        verify_csrf_pair(&self.settings.csrf_secret, cookie, header)
    }
}
