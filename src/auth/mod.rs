//! Authentication and authorization
//!
//! - `tokens`: signed session tokens carrying an identity version counter
//! - `context`: per-request identity resolution
//! - `policy`: per-operation scope checks in front of the store
//! - `password`: Argon2 credential hashing

mod context;
pub mod password;
mod policy;
mod tokens;

pub use context::{bearer_token, RequestContext};
pub use policy::Policy;
pub use tokens::{SessionToken, TokenClaims, TokenError, TokenService, SESSION_TOKEN_PREFIX};
