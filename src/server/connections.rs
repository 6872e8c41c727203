//! Connection state management

use crate::auth::RequestContext;
use crate::model::{Identity, UserId};
use crate::server::protocol::ServerMessage;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

/// Lifecycle of an authenticated socket connection
///
/// A [`Connection`] only exists once the handshake has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Subscribed,
    Closed,
}

/// One subscription operation on a connection
struct Operation {
    key: Uuid,
    active: bool,
    cancel: Option<oneshot::Sender<()>>,
}

/// An authenticated socket connection
pub struct Connection {
    /// Unique connection ID
    pub id: Uuid,
    /// Identity resolved at handshake, fixed for the connection's lifetime
    pub identity: Identity,
    ctx: RequestContext,
    /// Subscription operations by client-chosen id
    operations: Mutex<HashMap<String, Operation>>,
    /// Channel for sending messages to this client
    tx: mpsc::Sender<ServerMessage>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Connection {
    pub fn new(identity: Identity, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ctx: RequestContext::authenticated(identity.clone()),
            identity,
            operations: Mutex::new(HashMap::new()),
            tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.operations.lock().values().any(|op| op.active) {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Idle
        }
    }

    /// Claim an operation id while its authorization is pending.
    /// Returns `None` if the id is already in use.
    pub fn reserve_operation(&self, op_id: &str, cancel: oneshot::Sender<()>) -> Option<Uuid> {
        // `closed` is only set under this lock, so a racing close either
        // sees this entry or makes us bail.
        let mut ops = self.operations.lock();
        if self.is_closed() || ops.contains_key(op_id) {
            return None;
        }
        let key = Uuid::new_v4();
        ops.insert(
            op_id.to_string(),
            Operation {
                key,
                active: false,
                cancel: Some(cancel),
            },
        );
        Some(key)
    }

    /// Mark a reserved operation as a live subscription
    pub fn activate_operation(&self, op_id: &str, key: Uuid) -> bool {
        match self.operations.lock().get_mut(op_id) {
            Some(op) if op.key == key => {
                op.active = true;
                true
            }
            _ => false,
        }
    }

    /// Drop the operation entry if it still belongs to `key`
    pub fn release_operation(&self, op_id: &str, key: Uuid) {
        let mut ops = self.operations.lock();
        if ops.get(op_id).map(|op| op.key) == Some(key) {
            ops.remove(op_id);
        }
    }

    /// Ask the task behind an operation to stop
    pub fn cancel_operation(&self, op_id: &str) -> bool {
        let cancel = self
            .operations
            .lock()
            .get_mut(op_id)
            .and_then(|op| op.cancel.take());
        match cancel {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn operation_count(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn active_operations(&self) -> Vec<String> {
        self.operations
            .lock()
            .iter()
            .filter(|(_, op)| op.active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Send a message to this client
    pub async fn send(&self, msg: ServerMessage) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        self.tx.send(msg).await
    }

    /// Queue a message without waiting for queue space.
    ///
    /// Used from the socket's own read loop, which is also the queue's
    /// consumer and so must never block on it.
    pub fn reply(self: &Arc<Self>, msg: ServerMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let conn = self.clone();
                tokio::spawn(async move {
                    let _ = conn.send(msg).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Close the connection, cancelling every operation on it
    pub fn close(&self) {
        let cancels: Vec<_> = {
            let mut ops = self.operations.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            ops.values_mut().filter_map(|op| op.cancel.take()).collect()
        };
        for tx in cancels {
            let _ = tx.send(());
        }
        self.close_notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Connection::close`] has been called
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// Manages all active connections
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<DashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    pub fn add(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id, conn);
    }

    /// Remove a connection
    pub fn remove(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    /// Get a connection by ID
    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Get total connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// All connections authenticated as the given identity
    pub fn find_by_identity(&self, identity_id: UserId) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().identity.id == identity_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Close every connection of an identity. Returns how many were closed.
    pub fn disconnect_identity(&self, identity_id: UserId) -> usize {
        let conns = self.find_by_identity(identity_id);
        for conn in &conns {
            conn.close();
        }
        conns.len()
    }
}
