//! Per-request identity resolution
//!
//! A [`RequestContext`] is built once per HTTP request or socket connection,
//! right after the token is read off the transport, and then passed by
//! reference to every policy function.

use crate::auth::TokenService;
use crate::error::ApiError;
use crate::model::Identity;

#[derive(Debug, Clone)]
pub struct RequestContext {
    identity: Result<Identity, ApiError>,
}

impl RequestContext {
    /// Verify `token` (if any) and capture the outcome
    pub async fn resolve(tokens: &TokenService, token: Option<&str>) -> Self {
        let identity = match token {
            Some(token) => tokens.verify(token).await.map_err(ApiError::from),
            None => Err(ApiError::unauthenticated()),
        };
        Self { identity }
    }

    pub fn anonymous() -> Self {
        Self {
            identity: Err(ApiError::unauthenticated()),
        }
    }

    pub fn authenticated(identity: Identity) -> Self {
        Self {
            identity: Ok(identity),
        }
    }

    /// The caller's identity, or the authentication failure that prevented it
    pub fn identity(&self) -> Result<&Identity, ApiError> {
        self.identity.as_ref().map_err(Clone::clone)
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_ok()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
