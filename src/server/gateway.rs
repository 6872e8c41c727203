//! Subscription gateway
//!
//! Transport-independent handling of socket sessions: handshake, one task per
//! subscription operation, and teardown. The socket adapter only moves
//! [`ClientMessage`]s in and [`ServerMessage`]s out.

use crate::auth::Policy;
use crate::error::{ApiError, ApiResult};
use crate::events::AuthorizedStream;
use crate::server::connections::{Connection, ConnectionManager};
use crate::server::protocol::{ClientMessage, ServerMessage, SubscribePayload, Subscription};
use crate::model::UserId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Re-check group membership for every `messageAdded` event
    pub revalidate_membership: bool,
    /// Outbound queue depth per connection
    pub outbound_buffer: usize,
    /// How long a socket may stay open without sending `connection_init`
    pub init_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            revalidate_membership: false,
            outbound_buffer: 100,
            init_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    policy: Policy,
    connections: ConnectionManager,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(policy: Policy, config: GatewayConfig) -> Self {
        Self {
            policy,
            connections: ConnectionManager::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Authenticate a new socket.
    ///
    /// The identity is resolved once here and fixed for the connection's
    /// lifetime. On success the caller owns the outbound receiver.
    pub async fn connect(
        &self,
        token: &str,
    ) -> ApiResult<(Arc<Connection>, mpsc::Receiver<ServerMessage>)> {
        let identity = self.policy.tokens().verify(token).await.map_err(|e| {
            debug!(error = %e, "Socket handshake rejected");
            ApiError::from(e)
        })?;

        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        let conn = Arc::new(Connection::new(identity, tx));
        self.connections.add(conn.clone());

        info!(conn_id = %conn.id, identity_id = conn.identity.id, "Socket client authenticated");
        Ok((conn, rx))
    }

    /// Handle one message from an authenticated client
    pub fn handle(&self, conn: &Arc<Connection>, msg: ClientMessage) {
        match msg {
            ClientMessage::ConnectionInit { .. } => {
                // Already authenticated, ignore
            }
            ClientMessage::Subscribe { id, payload } => self.subscribe(conn, id, payload),
            ClientMessage::Complete { id } => {
                if !conn.cancel_operation(&id) {
                    debug!(conn_id = %conn.id, op_id = %id, "Complete for unknown operation");
                }
            }
            ClientMessage::Ping => conn.reply(ServerMessage::Pong),
        }
    }

    /// Start a subscription operation.
    ///
    /// The operation id is reserved immediately so that a `complete` racing
    /// the authorization check still reaches it. Nothing is registered as
    /// live until the check succeeds.
    pub fn subscribe(&self, conn: &Arc<Connection>, op_id: String, payload: SubscribePayload) {
        let subscription = match payload.parse() {
            Ok(s) => s,
            Err(e) => {
                conn.reply(ServerMessage::Error { id: op_id, error: e.payload() });
                return;
            }
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let Some(key) = conn.reserve_operation(&op_id, cancel_tx) else {
            let error = ApiError::Validation(format!("operation id '{}' is already in use", op_id));
            conn.reply(ServerMessage::Error { id: op_id, error: error.payload() });
            return;
        };

        let stream = match &subscription {
            Subscription::MessageAdded(args) => self.policy.message_added(
                conn.context(),
                args,
                self.config.revalidate_membership,
            ),
            Subscription::GroupAdded => self.policy.group_added(conn.context()),
        };

        debug!(conn_id = %conn.id, op_id = %op_id, topic = %subscription.topic(), "Subscription requested");
        tokio::spawn(run_operation(conn.clone(), op_id, key, stream, cancel_rx));
    }

    /// Tear down a connection and everything running on it
    pub fn disconnect(&self, conn: &Connection) {
        conn.close();
        self.connections.remove(conn.id);
        debug!(conn_id = %conn.id, "Socket client disconnected");
    }

    /// Close every live socket of an identity
    pub fn disconnect_identity(&self, identity_id: UserId) -> usize {
        let closed = self.connections.disconnect_identity(identity_id);
        if closed > 0 {
            info!(identity_id, closed, "Closed live sockets for identity");
        }
        closed
    }
}

async fn run_operation(
    conn: Arc<Connection>,
    op_id: String,
    key: uuid::Uuid,
    mut stream: AuthorizedStream,
    mut cancel: oneshot::Receiver<()>,
) {
    // Authorization phase. A cancel here must not leave a registration behind.
    let authorized = tokio::select! {
        outcome = stream.authorize() => Some(outcome),
        _ = &mut cancel => None,
    };

    match authorized {
        None => {
            stream.close().await;
            conn.release_operation(&op_id, key);
            let _ = conn.send(ServerMessage::Complete { id: op_id }).await;
            return;
        }
        Some(Err(e)) => {
            conn.release_operation(&op_id, key);
            debug!(conn_id = %conn.id, op_id = %op_id, error = %e, "Subscription rejected");
            let _ = conn.send(ServerMessage::Error { id: op_id, error: e.payload() }).await;
            return;
        }
        Some(Ok(())) => {}
    }

    if !conn.activate_operation(&op_id, key) {
        stream.close().await;
        return;
    }
    if conn.send(ServerMessage::Subscribed { id: op_id.clone() }).await.is_err() {
        conn.release_operation(&op_id, key);
        return;
    }

    loop {
        tokio::select! {
            _ = &mut cancel => {
                stream.close().await;
                let _ = conn.send(ServerMessage::Complete { id: op_id.clone() }).await;
                break;
            }
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    let msg = ServerMessage::Next { id: op_id.clone(), payload: event };
                    if conn.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(conn_id = %conn.id, op_id = %op_id, error = %e, "Subscription revoked");
                    let _ = conn.send(ServerMessage::Error { id: op_id.clone(), error: e.payload() }).await;
                    break;
                }
                None => {
                    let _ = conn.send(ServerMessage::Complete { id: op_id.clone() }).await;
                    break;
                }
            }
        }
    }

    conn.release_operation(&op_id, key);
}
