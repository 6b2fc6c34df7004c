//! Signed bearer tokens and password digests for API users.
//!
//! A token is `<claims>.<signature>`, both URL-safe base64 without padding.
//! The claims are JSON `{"id": <user>, "exp": <unix seconds>}`; the signature
//! is HMAC-SHA256 of the encoded claims under the site secret.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// The only user allowed to create other users.
pub const ADMIN_USER: &str = "admin";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token")]
    Malformed,

    #[error("token signature does not match")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("signing key rejected")]
    InvalidKey,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    id: String,
    exp: i64,
}

fn keyed(key: &[u8]) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(key).map_err(|_| AuthError::InvalidKey)
}

/// Issues and verifies tokens under one secret.
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    pub fn issue(&self, user: &str) -> Result<String, AuthError> {
        self.issue_at(user, Utc::now())
    }

    pub fn issue_at(&self, user: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            id: user.to_string(),
            exp: now.timestamp().saturating_add(ttl),
        };
        let payload = serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?;
        let encoded = URL_SAFE_NO_PAD.encode(payload);

        let mut mac = keyed(&self.secret)?;
        mac.update(encoded.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{encoded}.{signature}"))
    }

    /// The user a token was issued to.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let (encoded, signature) = token.trim().split_once('.').ok_or(AuthError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac = keyed(&self.secret)?;
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| AuthError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if now.timestamp() >= claims.exp {
            return Err(AuthError::Expired);
        }
        Ok(claims.id)
    }
}

// ---------------------------------------------------------------------------
// Passwords
// ---------------------------------------------------------------------------

/// Salted digest of `password`, stored as `<salt>$<digest>`.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes());
    let mut mac = keyed(salt.as_bytes())?;
    mac.update(password.as_bytes());
    let digest = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{salt}${digest}"))
}

/// Whether `password` matches a digest from [`hash_password`].
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let Ok(digest) = URL_SAFE_NO_PAD.decode(digest) else {
        return false;
    };
    let Ok(mut mac) = keyed(salt.as_bytes()) else {
        return false;
    };
    mac.update(password.as_bytes());
    mac.verify_slice(&digest).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("a-long-enough-secret", Duration::from_secs(60))
    }

    #[test]
    fn issued_token_names_its_user() {
        let token = signer().issue("alice").unwrap();
        assert_eq!(signer().verify(&token).unwrap(), "alice");
    }

    #[test]
    fn token_expires_after_ttl() {
        let now = Utc::now();
        let token = signer().issue_at("alice", now).unwrap();
        let later = now + chrono::Duration::seconds(59);
        assert_eq!(signer().verify_at(&token, later).unwrap(), "alice");
        let expired = now + chrono::Duration::seconds(60);
        assert_eq!(signer().verify_at(&token, expired), Err(AuthError::Expired));
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let other = TokenSigner::new("some-other-secret", Duration::from_secs(60));
        let token = other.issue("admin").unwrap();
        assert_eq!(signer().verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let token = signer().issue("alice").unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"id":"admin","exp":99999999999}"#);
        assert_eq!(
            signer().verify(&format!("{forged}.{signature}")),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(signer().verify("not-a-token"), Err(AuthError::Malformed));
        assert_eq!(signer().verify("abc.!!!"), Err(AuthError::Malformed));
    }

    #[test]
    fn huge_ttl_saturates() {
        let signer = TokenSigner::new("a-long-enough-secret", Duration::from_secs(u64::MAX));
        let token = signer.issue("alice").unwrap();
        assert_eq!(signer.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn password_digest_roundtrip() {
        let stored = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
        assert_ne!(hash_password("hunter2").unwrap(), stored);
        assert!(!verify_password("hunter2", "no-separator"));
    }
}
