//! Session tokens
//!
//! Wire form: `sess-<payload>.<signature>`, both base64url without padding.
//! The payload embeds the identity's version counter; bumping the counter in
//! the store invalidates every token issued before the bump.

use crate::model::{Identity, UserId, UserRecord};
use crate::storage::{Store, StorageError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const SESSION_TOKEN_PREFIX: &str = "sess-";

/// Bytes of the HMAC kept in the token
const SIGNATURE_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    InvalidFormat,

    #[error("invalid token prefix")]
    InvalidPrefix,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token decode error: {0}")]
    DecodeError(String),

    #[error("token has been revoked")]
    Stale,

    #[error("token has expired")]
    Expired,

    #[error("unknown identity")]
    UnknownIdentity,

    #[error("identity lookup failed: {0}")]
    Lookup(#[from] StorageError),
}

/// Signed claims carried by a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub identity_id: UserId,
    pub version: u64,
    /// Unix seconds
    pub issued_at: i64,
}

/// A signed session token
#[derive(Debug, Clone)]
pub struct SessionToken {
    token: String,
    claims: TokenClaims,
}

fn sign(secret: &[u8], payload_b64: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload_b64.as_bytes());
    mac
}

impl SessionToken {
    /// Sign a set of claims
    pub fn create(claims: TokenClaims, secret: &[u8]) -> Self {
        let payload_json = serde_json::to_vec(&claims).expect("serialize claims");
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);

        let signature = sign(secret, &payload_b64).finalize().into_bytes();
        let signature_b64 = URL_SAFE_NO_PAD.encode(&signature[..SIGNATURE_LEN]);

        let token = format!("{}{}.{}", SESSION_TOKEN_PREFIX, payload_b64, signature_b64);
        Self { token, claims }
    }

    /// Check structure and signature. Does not consult the store.
    pub fn parse(token: &str, secret: &[u8]) -> Result<Self, TokenError> {
        let content = token
            .strip_prefix(SESSION_TOKEN_PREFIX)
            .ok_or(TokenError::InvalidPrefix)?;

        let (payload_b64, signature_b64) =
            content.split_once('.').ok_or(TokenError::InvalidFormat)?;
        if payload_b64.is_empty() || signature_b64.contains('.') {
            return Err(TokenError::InvalidFormat);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::InvalidSignature)?;
        if signature.len() != SIGNATURE_LEN {
            return Err(TokenError::InvalidSignature);
        }
        sign(secret, payload_b64)
            .verify_truncated_left(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&payload_json)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;

        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Issues and verifies session tokens against the store's version counters
#[derive(Clone)]
pub struct TokenService {
    secret: Arc<Vec<u8>>,
    store: Arc<dyn Store>,
    ttl: Option<Duration>,
}

impl TokenService {
    pub fn new(secret: Vec<u8>, store: Arc<dyn Store>) -> Self {
        Self {
            secret: Arc::new(secret),
            store,
            ttl: None,
        }
    }

    /// Reject tokens older than `ttl` in addition to version checks
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn issue(&self, identity: &Identity) -> SessionToken {
        let claims = TokenClaims {
            identity_id: identity.id,
            version: identity.version,
            issued_at: Utc::now().timestamp(),
        };
        SessionToken::create(claims, &self.secret)
    }

    /// Resolve a token to the identity it was issued for
    pub async fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        let parsed = SessionToken::parse(token, &self.secret)?;
        let claims = parsed.claims();

        if let Some(ttl) = self.ttl {
            let age = Utc::now().timestamp().saturating_sub(claims.issued_at);
            if age < 0 || age as u64 > ttl.as_secs() {
                return Err(TokenError::Expired);
            }
        }

        let user = self
            .store
            .find_user(claims.identity_id)
            .await?
            .ok_or(TokenError::UnknownIdentity)?;

        if user.version != claims.version {
            debug!(
                identity_id = user.id,
                token_version = claims.version,
                current_version = user.version,
                "Rejected stale token"
            );
            return Err(TokenError::Stale);
        }

        Ok(user.identity())
    }

    /// Invalidate every token issued so far for this identity
    pub async fn bump_version(&self, identity_id: UserId) -> Result<UserRecord, StorageError> {
        let user = self.store.bump_user_version(identity_id).await?;
        debug!(identity_id, version = user.version, "Identity version bumped");
        Ok(user)
    }
}
