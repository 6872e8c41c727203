//! Huddle - group chat API with authorized live subscriptions
//!
//! Queries and mutations go over HTTP, `messageAdded` and `groupAdded`
//! subscriptions over WebSocket. Every field and operation is checked by the
//! [`auth::Policy`] against the caller's session, and session tokens die as
//! soon as the account's version counter moves.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod inputs;
pub mod model;
pub mod pagination;
pub mod server;
pub mod storage;

pub use auth::{Policy, RequestContext, SessionToken, TokenService};
pub use config::ServerConfig;
pub use error::{ApiError, ApiResult, ErrorKind};
pub use events::{Event, EventBus, Topic};
pub use server::HuddleServer;
