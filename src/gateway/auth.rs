//! Handshake Tokens
//!
//! Keyed-digest bearer tokens carried in the websocket upgrade request:
//! `{user_id}.{username}.{expiry_ms}.{hex(sha256(base || key))}`. Minting is
//! exposed for operators and tests; interactive login lives outside the
//! engine.

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Token verification errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("bad token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Verified identity extracted from a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: Uuid,
    pub username: String,
    pub expires_at_ms: i64,
}

/// Sign a token for `user_id` valid for `ttl_ms` from `now_ms`.
pub fn mint(user_id: Uuid, username: &str, now_ms: i64, ttl_ms: i64, key: &str) -> String {
    let base = format!("{user_id}.{username}.{}", now_ms + ttl_ms);
    format!("{base}.{}", digest(&base, key))
}

/// Verify signature and expiry, returning the embedded claims.
pub fn verify(token: &str, key: &str, now_ms: i64) -> Result<AuthClaims, AuthError> {
    // usernames may contain dots: fixed fields sit at both ends
    let (base, signature) = token.rsplit_once('.').ok_or(AuthError::Malformed)?;
    let (head, expiry_text) = base.rsplit_once('.').ok_or(AuthError::Malformed)?;
    let (user_text, username) = head.split_once('.').ok_or(AuthError::Malformed)?;

    let user_id = Uuid::parse_str(user_text).map_err(|_| AuthError::Malformed)?;
    let expires_at_ms: i64 = expiry_text.parse().map_err(|_| AuthError::Malformed)?;
    if username.is_empty() {
        return Err(AuthError::Malformed);
    }

    if !constant_time_eq(&digest(base, key), signature) {
        return Err(AuthError::BadSignature);
    }
    if now_ms >= expires_at_ms {
        return Err(AuthError::Expired);
    }

    Ok(AuthClaims {
        user_id,
        username: username.to_string(),
        expires_at_ms,
    })
}

fn digest(base: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-signing-key";

    #[test]
    fn round_trip() {
        let user_id = Uuid::new_v4();
        let token = mint(user_id, "alice", 1_000, 60_000, KEY);

        let claims = verify(&token, KEY, 2_000).unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.expires_at_ms, 61_000);
    }

    #[test]
    fn dotted_usernames_survive() {
        let user_id = Uuid::new_v4();
        let token = mint(user_id, "a.b.c", 0, 60_000, KEY);
        assert_eq!(verify(&token, KEY, 1).unwrap().username, "a.b.c");
    }

    #[test]
    fn tampering_is_detected() {
        let token = mint(Uuid::new_v4(), "alice", 0, 60_000, KEY);

        let mut forged = token.clone();
        forged.replace_range(..1, if token.starts_with('0') { "1" } else { "0" });
        assert!(matches!(
            verify(&forged, KEY, 1),
            Err(AuthError::Malformed) | Err(AuthError::BadSignature)
        ));

        assert_eq!(verify(&token, "other-key", 1), Err(AuthError::BadSignature));
    }

    #[test]
    fn expiry_is_enforced() {
        let token = mint(Uuid::new_v4(), "alice", 0, 60_000, KEY);
        assert_eq!(verify(&token, KEY, 60_000), Err(AuthError::Expired));
    }

    #[test]
    fn garbage_is_malformed() {
        for junk in ["", "a.b", "not-a-uuid.alice.123.deadbeef"] {
            assert_eq!(verify(junk, KEY, 0), Err(AuthError::Malformed));
        }
    }
}
