use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::dub_core::domain::{ApiKeyRecord, InviteRecord, RefreshTokenRecord, Role, User};

use super::{Db, StoreError, StoreResult};

/// Per-user quota overrides; `None` falls back to the global default.
#[derive(Debug, Clone, Default)]
pub struct QuotaOverrides {
    pub max_upload_bytes: Option<u64>,
    pub jobs_per_day: Option<u64>,
    pub max_concurrent_jobs: Option<u64>,
    pub max_storage_bytes: Option<u64>,
}

/// Typed operations over `auth.db`: users, refresh tokens, API keys, invites,
/// quota overrides.
pub struct AuthStore {
    db: Arc<Db>,
}

fn user_from_row(row: &Row<'_>) -> Result<User, rusqlite::Error> {
    let role_raw: String = row.get("role")?;
    let created_raw: String = row.get("created_at")?;
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        role: Role::parse(&role_raw).unwrap_or(Role::Viewer),
        totp_secret: row.get("totp_secret")?,
        created_at: parse_ts(&created_raw),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn refresh_from_row(row: &Row<'_>) -> Result<RefreshTokenRecord, rusqlite::Error> {
    Ok(RefreshTokenRecord {
        jti: row.get("jti")?,
        user_id: row.get("user_id")?,
        token_hash: row.get("token_hash")?,
        expires_at: row.get("expires_at")?,
        created_at: row.get("created_at")?,
        revoked: row.get::<_, i64>("revoked")? != 0,
        replaced_by: row.get("replaced_by")?,
        device_id: row.get("device_id")?,
        last_ip: row.get("last_ip")?,
        user_agent: row.get("user_agent")?,
    })
}

fn api_key_from_row(row: &Row<'_>) -> Result<ApiKeyRecord, rusqlite::Error> {
    let scopes_raw: String = row.get("scopes")?;
    let created_raw: String = row.get("created_at")?;
    Ok(ApiKeyRecord {
        id: row.get("id")?,
        prefix: row.get("prefix")?,
        key_hash: row.get("key_hash")?,
        scopes: serde_json::from_str(&scopes_raw).unwrap_or_default(),
        user_id: row.get("user_id")?,
        created_at: parse_ts(&created_raw),
        revoked: row.get::<_, i64>("revoked")? != 0,
    })
}

impl AuthStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Arc::new(Db::open(path)?);
        let store = Self { db };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL,
                    totp_secret TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS refresh_tokens (
                    jti TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    token_hash TEXT NOT NULL,
                    expires_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    revoked INTEGER NOT NULL DEFAULT 0,
                    replaced_by TEXT,
                    device_id TEXT,
                    last_ip TEXT,
                    user_agent TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_refresh_user ON refresh_tokens(user_id);
                CREATE TABLE IF NOT EXISTS api_keys (
                    id TEXT PRIMARY KEY,
                    prefix TEXT NOT NULL,
                    key_hash TEXT NOT NULL,
                    scopes TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    revoked INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(prefix);
                CREATE TABLE IF NOT EXISTS invites (
                    token_hash TEXT PRIMARY KEY,
                    created_by TEXT NOT NULL,
                    expires_at INTEGER NOT NULL,
                    used_by TEXT
                );
                CREATE TABLE IF NOT EXISTS user_quotas (
                    user_id TEXT PRIMARY KEY,
                    max_upload_bytes INTEGER,
                    jobs_per_day INTEGER,
                    max_concurrent_jobs INTEGER,
                    max_storage_bytes INTEGER
                );
                "#,
            )?;
            Ok(())
        })
    }

    // ---- users -------------------------------------------------------------

    pub fn create_user(&self, user: &User) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password_hash, role, totp_secret, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.id,
                    user.username,
                    user.password_hash,
                    user.role.as_str(),
                    user.totp_secret,
                    user.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], user_from_row)
                .optional()
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()
        })
    }

    pub fn count_users(&self) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    pub fn list_users(&self) -> StoreResult<Vec<User>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM users ORDER BY created_at")?;
            let rows = stmt.query_map([], user_from_row)?;
            rows.collect()
        })
    }

    // ---- refresh tokens ----------------------------------------------------

    pub fn put_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO refresh_tokens
                 (jti, user_id, token_hash, expires_at, created_at, revoked, replaced_by,
                  device_id, last_ip, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.jti,
                    record.user_id,
                    record.token_hash,
                    record.expires_at,
                    record.created_at,
                    record.revoked as i64,
                    record.replaced_by,
                    record.device_id,
                    record.last_ip,
                    record.user_agent,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_refresh_token(&self, jti: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM refresh_tokens WHERE jti = ?1",
                params![jti],
                refresh_from_row,
            )
            .optional()
        })
    }

    /// Mark the old token consumed and point it at its successor.
    pub fn rotate_refresh_token(&self, old_jti: &str, new_jti: &str) -> StoreResult<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE refresh_tokens SET revoked = 1, replaced_by = ?2 WHERE jti = ?1",
                params![old_jti, new_jti],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn revoke_refresh_token(&self, jti: &str) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE refresh_tokens SET revoked = 1 WHERE jti = ?1",
                params![jti],
            )?;
            Ok(())
        })
    }

    pub fn revoke_all_refresh_tokens_for_user(&self, user_id: &str) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?1 AND revoked = 0",
                params![user_id],
            )?;
            Ok(n as u64)
        })
    }

    // ---- api keys ----------------------------------------------------------

    pub fn put_api_key(&self, key: &ApiKeyRecord) -> StoreResult<()> {
        let scopes = serde_json::to_string(&key.scopes).unwrap_or_else(|_| "[]".to_string());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO api_keys (id, prefix, key_hash, scopes, user_id, created_at, revoked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key.id,
                    key.prefix,
                    key.key_hash,
                    scopes,
                    key.user_id,
                    key.created_at.to_rfc3339(),
                    key.revoked as i64,
                ],
            )?;
            Ok(())
        })
    }

    /// All candidates for a prefix; the caller does the constant-time hash
    /// verification so timing never depends on which row matched.
    pub fn find_api_keys_by_prefix(&self, prefix: &str) -> StoreResult<Vec<ApiKeyRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM api_keys WHERE prefix = ?1 AND revoked = 0")?;
            let rows = stmt.query_map(params![prefix], api_key_from_row)?;
            rows.collect()
        })
    }

    pub fn revoke_api_key(&self, id: &str) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute("UPDATE api_keys SET revoked = 1 WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn list_api_keys_for_user(&self, user_id: &str) -> StoreResult<Vec<ApiKeyRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM api_keys WHERE user_id = ?1 ORDER BY created_at")?;
            let rows = stmt.query_map(params![user_id], api_key_from_row)?;
            rows.collect()
        })
    }

    // ---- invites -----------------------------------------------------------

    pub fn put_invite(&self, invite: &InviteRecord) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO invites (token_hash, created_by, expires_at, used_by)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    invite.token_hash,
                    invite.created_by,
                    invite.expires_at,
                    invite.used_by,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_invite(&self, token_hash: &str) -> StoreResult<Option<InviteRecord>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM invites WHERE token_hash = ?1",
                params![token_hash],
                |row| {
                    Ok(InviteRecord {
                        token_hash: row.get("token_hash")?,
                        created_by: row.get("created_by")?,
                        expires_at: row.get("expires_at")?,
                        used_by: row.get("used_by")?,
                    })
                },
            )
            .optional()
        })
    }

    /// Consume an invite; fails if already used (single-use contract).
    pub fn mark_invite_used(&self, token_hash: &str, used_by: &str) -> StoreResult<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE invites SET used_by = ?2 WHERE token_hash = ?1 AND used_by IS NULL",
                params![token_hash, used_by],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::Conflict("invite already used".to_string()));
        }
        Ok(())
    }

    // ---- quota overrides ---------------------------------------------------

    pub fn quota_overrides(&self, user_id: &str) -> StoreResult<QuotaOverrides> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT max_upload_bytes, jobs_per_day, max_concurrent_jobs, max_storage_bytes
                 FROM user_quotas WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(QuotaOverrides {
                        max_upload_bytes: row.get::<_, Option<i64>>(0)?.map(|v| v as u64),
                        jobs_per_day: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                        max_concurrent_jobs: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                        max_storage_bytes: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                    })
                },
            )
            .optional()
            .map(Option::unwrap_or_default)
        })
    }

    pub fn set_quota_overrides(&self, user_id: &str, quotas: &QuotaOverrides) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_quotas
                 (user_id, max_upload_bytes, jobs_per_day, max_concurrent_jobs, max_storage_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    max_upload_bytes = excluded.max_upload_bytes,
                    jobs_per_day = excluded.jobs_per_day,
                    max_concurrent_jobs = excluded.max_concurrent_jobs,
                    max_storage_bytes = excluded.max_storage_bytes",
                params![
                    user_id,
                    quotas.max_upload_bytes.map(|v| v as i64),
                    quotas.jobs_per_day.map(|v| v as i64),
                    quotas.max_concurrent_jobs.map(|v| v as i64),
                    quotas.max_storage_bytes.map(|v| v as i64),
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, AuthStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(&dir.path().join("auth.db")).unwrap();
        (dir, store)
    }

    fn test_user(id: &str, username: &str) -> User {
        User {
            id: id.to_string(),
            username: username.to_string(),
            password_hash: "argon2-hash".to_string(),
            role: Role::Operator,
            totp_secret: None,
            created_at: Utc::now(),
        }
    }

    fn test_refresh(jti: &str, user_id: &str) -> RefreshTokenRecord {
        RefreshTokenRecord {
            jti: jti.to_string(),
            user_id: user_id.to_string(),
            token_hash: format!("hash-{jti}"),
            expires_at: Utc::now().timestamp() + 3600,
            created_at: Utc::now().timestamp(),
            revoked: false,
            replaced_by: None,
            device_id: None,
            last_ip: None,
            user_agent: None,
        }
    }

    #[test]
    fn users_round_trip_by_id_and_username() {
        let (_dir, store) = test_store();
        store.create_user(&test_user("u1", "alice")).unwrap();

        let by_id = store.get_user("u1").unwrap().unwrap();
        assert_eq!(by_id.username, "alice");
        assert_eq!(by_id.role, Role::Operator);

        let by_name = store.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, "u1");
        assert!(store.get_user("missing").unwrap().is_none());
        assert_eq!(store.count_users().unwrap(), 1);
    }

    #[test]
    fn rotation_marks_old_token_with_successor() {
        let (_dir, store) = test_store();
        store.put_refresh_token(&test_refresh("r1", "u1")).unwrap();
        store.put_refresh_token(&test_refresh("r2", "u1")).unwrap();
        store.rotate_refresh_token("r1", "r2").unwrap();

        let old = store.get_refresh_token("r1").unwrap().unwrap();
        assert!(old.revoked);
        assert_eq!(old.replaced_by.as_deref(), Some("r2"));

        let new = store.get_refresh_token("r2").unwrap().unwrap();
        assert!(!new.revoked);
    }

    #[test]
    fn revoke_all_only_touches_the_given_user() {
        let (_dir, store) = test_store();
        store.put_refresh_token(&test_refresh("r1", "u1")).unwrap();
        store.put_refresh_token(&test_refresh("r2", "u1")).unwrap();
        store.put_refresh_token(&test_refresh("r3", "u2")).unwrap();

        assert_eq!(store.revoke_all_refresh_tokens_for_user("u1").unwrap(), 2);
        assert!(store.get_refresh_token("r1").unwrap().unwrap().revoked);
        assert!(store.get_refresh_token("r2").unwrap().unwrap().revoked);
        assert!(!store.get_refresh_token("r3").unwrap().unwrap().revoked);
    }

    #[test]
    fn api_key_lookup_returns_only_live_prefix_matches() {
        let (_dir, store) = test_store();
        let mut key = ApiKeyRecord {
            id: "k1".to_string(),
            prefix: "abcdefghij".to_string(),
            key_hash: "h1".to_string(),
            scopes: vec!["read:job".to_string()],
            user_id: "u1".to_string(),
            created_at: Utc::now(),
            revoked: false,
        };
        store.put_api_key(&key).unwrap();
        key.id = "k2".to_string();
        key.key_hash = "h2".to_string();
        store.put_api_key(&key).unwrap();

        assert_eq!(store.find_api_keys_by_prefix("abcdefghij").unwrap().len(), 2);
        store.revoke_api_key("k1").unwrap();
        let live = store.find_api_keys_by_prefix("abcdefghij").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "k2");
        assert_eq!(live[0].scopes, vec!["read:job"]);
    }

    #[test]
    fn invites_are_single_use() {
        let (_dir, store) = test_store();
        store
            .put_invite(&InviteRecord {
                token_hash: "ih".to_string(),
                created_by: "admin".to_string(),
                expires_at: Utc::now().timestamp() + 600,
                used_by: None,
            })
            .unwrap();

        store.mark_invite_used("ih", "u9").unwrap();
        let err = store.mark_invite_used("ih", "u10").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn quota_overrides_default_to_unset() {
        let (_dir, store) = test_store();
        let q = store.quota_overrides("u1").unwrap();
        assert!(q.max_upload_bytes.is_none());

        store
            .set_quota_overrides(
                "u1",
                &QuotaOverrides {
                    jobs_per_day: Some(3),
                    ..Default::default()
                },
            )
            .unwrap();
        let q = store.quota_overrides("u1").unwrap();
        assert_eq!(q.jobs_per_day, Some(3));
        assert!(q.max_storage_bytes.is_none());
    }
}
