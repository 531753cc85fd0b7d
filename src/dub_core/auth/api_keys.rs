use chrono::Utc;
use subtle::ConstantTimeEq;

use crate::dub_core::domain::ApiKeyRecord;
use crate::dub_core::hashing::{random_id, sha256_hex};
use crate::dub_core::store::AuthStore;

use super::AuthError;

pub const API_KEY_MARKER: &str = "dp_";
const PREFIX_LEN: usize = 10;
const SECRET_LEN: usize = 32;

/// Freshly minted key: the plaintext leaves the process exactly once, in the
/// create response; only the hash is stored.
pub struct MintedApiKey {
    pub record: ApiKeyRecord,
    pub plaintext: String,
}

pub fn mint_api_key(user_id: &str, scopes: Vec<String>) -> MintedApiKey {
    let prefix = random_id("", PREFIX_LEN);
    let secret = random_id("", SECRET_LEN);
    let plaintext = format!("{API_KEY_MARKER}{prefix}_{secret}");
    let record = ApiKeyRecord {
        id: uuid::Uuid::new_v4().to_string(),
        prefix,
        key_hash: sha256_hex(plaintext.as_bytes()),
        scopes,
        user_id: user_id.to_string(),
        created_at: Utc::now(),
        revoked: false,
    };
    MintedApiKey { record, plaintext }
}

fn split_key(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix(API_KEY_MARKER)?;
    let (prefix, secret) = rest.split_once('_')?;
    if prefix.len() != PREFIX_LEN || secret.is_empty() {
        return None;
    }
    Some((prefix, secret))
}

/// Resolve a presented key: load every candidate for the prefix, then verify
/// the stored hash in constant time against each one so timing does not
/// reveal which candidate (if any) matched.
pub fn verify_api_key(store: &AuthStore, raw: &str) -> Result<ApiKeyRecord, AuthError> {
    let (prefix, _) = split_key(raw).ok_or(AuthError::InvalidCredential)?;
    let candidates = store
        .find_api_keys_by_prefix(prefix)
        .map_err(|_| AuthError::Internal)?;
    let presented_hash = sha256_hex(raw.as_bytes());

    let mut matched: Option<ApiKeyRecord> = None;
    for candidate in candidates {
        let equal: bool = candidate
            .key_hash
            .as_bytes()
            .ct_eq(presented_hash.as_bytes())
            .into();
        if equal && matched.is_none() {
            matched = Some(candidate);
        }
    }
    matched.ok_or(AuthError::InvalidCredential)
}

/// Whether an Authorization bearer value is actually an API key in disguise.
pub fn looks_like_api_key(raw: &str) -> bool {
    raw.starts_with(API_KEY_MARKER)
}
