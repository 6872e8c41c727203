//! WebSocket adapter for the subscription gateway

use crate::error::ApiError;
use crate::server::connections::Connection;
use crate::server::gateway::Gateway;
use crate::server::http::AppState;
use crate::server::protocol::{ClientMessage, ServerMessage};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocket, Message>;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn send_json(sender: &mut WsSink, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode server message");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

fn decode(msg: &Message) -> Option<Result<ClientMessage, serde_json::Error>> {
    match msg {
        Message::Text(text) => Some(serde_json::from_str(text.as_str())),
        Message::Binary(data) => Some(serde_json::from_slice(data)),
        _ => None,
    }
}

/// Wait for `connection_init` and authenticate.
///
/// Anything other than a valid init ends the socket without creating a
/// connection.
async fn handshake(
    sender: &mut WsSink,
    receiver: &mut SplitStream<WebSocket>,
    gateway: &Gateway,
) -> Option<(Arc<Connection>, mpsc::Receiver<ServerMessage>)> {
    // One deadline for the whole handshake; control frames do not extend it
    let deadline = tokio::time::Instant::now() + gateway.config().init_timeout;
    let first = loop {
        let next = tokio::time::timeout_at(deadline, receiver.next()).await;
        match next {
            Ok(Some(Ok(msg))) => match decode(&msg) {
                Some(decoded) => break decoded,
                None if matches!(msg, Message::Close(_)) => return None,
                // Ping/Pong frames
                None => continue,
            },
            Ok(_) => return None,
            Err(_) => {
                debug!("Socket closed: no connection_init before timeout");
                let error = ApiError::unauthenticated();
                let _ = send_json(sender, &ServerMessage::ConnectionError { error: error.payload() }).await;
                let _ = sender.send(Message::Close(None)).await;
                return None;
            }
        }
    };

    let result = match first {
        Ok(ClientMessage::ConnectionInit { payload }) => gateway.connect(&payload.token).await,
        Ok(_) => Err(ApiError::Authentication(
            "connection_init must be the first message".to_string(),
        )),
        Err(e) => Err(ApiError::Validation(format!("invalid message: {}", e))),
    };

    match result {
        Ok((conn, rx)) => {
            let ack = ServerMessage::ConnectionAck { identity: conn.identity.clone() };
            if send_json(sender, &ack).await.is_err() {
                gateway.disconnect(&conn);
                return None;
            }
            Some((conn, rx))
        }
        Err(e) => {
            let _ = send_json(sender, &ServerMessage::ConnectionError { error: e.payload() }).await;
            let _ = sender.send(Message::Close(None)).await;
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();

    let Some((conn, mut rx)) = handshake(&mut sender, &mut receiver, &gateway).await else {
        return;
    };
    let conn_id = conn.id;

    loop {
        tokio::select! {
            _ = conn.closed() => {
                debug!(conn_id = %conn_id, "Closing socket on server request");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            outbound = rx.recv() => match outbound {
                Some(msg) => {
                    if send_json(&mut sender, &msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(msg)) => match decode(&msg) {
                    Some(Ok(client_msg)) => gateway.handle(&conn, client_msg),
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "Ignoring undecodable message");
                    }
                    // Ping/Pong frames are answered by axum
                    None => {}
                },
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    // Cleanup
    gateway.disconnect(&conn);
}
