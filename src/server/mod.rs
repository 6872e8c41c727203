//! Huddle server implementation
//!
//! Serves queries and mutations over HTTP and subscriptions over WebSocket,
//! both backed by one [`Policy`] and one [`EventBus`].

mod connections;
mod dispatch;
mod gateway;
mod http;
pub mod protocol;
mod websocket;

pub use connections::{Connection, ConnectionManager, ConnectionState};
pub use dispatch::Dispatcher;
pub use gateway::{Gateway, GatewayConfig};
pub use http::{create_router, AppState};
pub use protocol::{ClientMessage, Mutation, OperationRequest, Query, ServerMessage, SubscribePayload};

use crate::auth::{Policy, TokenService};
use crate::config::ServerConfig;
use crate::events::EventBus;
use crate::storage::Store;
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tracing::info;

pub struct HuddleServer {
    config: ServerConfig,
    store: Arc<dyn Store>,
    policy: Policy,
    gateway: Gateway,
    dispatcher: Dispatcher,
}

impl HuddleServer {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let tokens = TokenService::new(config.token_secret.clone(), store.clone())
            .with_ttl(config.token_ttl);
        let policy = Policy::new(store.clone(), tokens, EventBus::new());
        let gateway = Gateway::new(policy.clone(), config.gateway.clone());

        let mut dispatcher = Dispatcher::new(policy.clone());
        if config.revoke_live_sockets {
            dispatcher = dispatcher.with_socket_revocation(gateway.clone());
        }

        Self {
            config,
            store,
            policy,
            gateway,
            dispatcher,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.gateway.connections().count()
    }

    pub fn router(&self) -> Router {
        create_router(AppState {
            dispatcher: self.dispatcher.clone(),
            gateway: self.gateway.clone(),
            store: self.store.clone(),
        })
    }

    /// Bind and serve until the listener fails
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "Huddle server listening");

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
