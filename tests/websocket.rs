//! End-to-end tests over a real listener
//!
//! HTTP requests are written by hand over a TCP stream; the socket side uses
//! tokio-tungstenite.

use futures::{SinkExt, StreamExt};
use huddle::config::ServerConfig;
use huddle::server::HuddleServer;
use huddle::storage::MemoryStore;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_SECRET: &[u8] = b"test-secret-for-end-to-end-tests-0123456789";

async fn start_server(revoke_live_sockets: bool) -> SocketAddr {
    start_server_with(|config| config.revoke_live_sockets = revoke_live_sockets).await
}

async fn start_server_with(configure: impl FnOnce(&mut ServerConfig)) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = ServerConfig::new(addr, TEST_SECRET.to_vec());
    configure(&mut config);
    let server = HuddleServer::new(config, Arc::new(MemoryStore::new()));
    let app = server.router();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Minimal HTTP/1.1 POST returning (status, body)
async fn post(addr: SocketAddr, path: &str, token: Option<&str>, body: Value) -> (u16, Value) {
    let body = body.to_string();
    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        addr,
        auth,
        body.len(),
        body
    );

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let raw = String::from_utf8(raw).unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
    (status, serde_json::from_str(body).unwrap())
}

async fn mutation(addr: SocketAddr, token: Option<&str>, op: &str, input: Value) -> (u16, Value) {
    post(addr, "/mutation", token, json!({ "operation": op, "input": input })).await
}

async fn query(addr: SocketAddr, token: Option<&str>, op: &str, input: Value) -> (u16, Value) {
    post(addr, "/query", token, json!({ "operation": op, "input": input })).await
}

async fn signup(addr: SocketAddr, name: &str) -> (String, i64) {
    let (status, body) = mutation(
        addr,
        None,
        "signup",
        json!({
            "displayName": name,
            "email": format!("{}@example.com", name.to_lowercase()),
            "password": "long enough password",
        }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let token = body["data"]["token"].as_str().unwrap().to_string();
    let id = body["data"]["user"]["id"].as_i64().unwrap();
    (token, id)
}

async fn connect(addr: SocketAddr) -> Socket {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

async fn send(ws: &mut Socket, msg: Value) {
    ws.send(Message::Text(msg.to_string())).await.unwrap();
}

async fn next_json(ws: &mut Socket) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for socket message")
            .expect("socket ended")
            .unwrap();
        match msg {
            Message::Text(_) => return serde_json::from_str(msg.to_text().unwrap()).unwrap(),
            Message::Close(_) => return json!({ "type": "closed" }),
            _ => continue,
        }
    }
}

async fn open_session(addr: SocketAddr, token: &str) -> Socket {
    let mut ws = connect(addr).await;
    send(&mut ws, json!({ "type": "connection_init", "payload": { "token": token } })).await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "connection_ack", "{}", ack);
    ws
}

#[tokio::test]
async fn test_health() {
    let addr = start_server(false).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET /health HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", addr).as_bytes())
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 200"));
    assert!(raw.ends_with("ok"));
}

#[tokio::test]
async fn test_http_errors_carry_kind() {
    let addr = start_server(false).await;
    let (ann_token, _) = signup(addr, "Ann").await;
    let (_, bob_id) = signup(addr, "Bob").await;

    let (status, body) = query(addr, None, "me", Value::Null).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"]["kind"], "Authentication");

    let (status, body) = query(addr, Some(&ann_token), "userEmail", json!({ "userId": bob_id })).await;
    assert_eq!(status, 403);
    assert_eq!(body["error"]["kind"], "Forbidden");

    let (status, body) = query(addr, Some(&ann_token), "group", json!({ "groupId": 77 })).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["kind"], "NotFound");

    let (status, body) = mutation(addr, Some(&ann_token), "createGroup", json!({ "name": "" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["kind"], "Validation");

    let (status, body) = query(addr, Some(&ann_token), "me", Value::Null).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["email"], "ann@example.com");
}

#[tokio::test]
async fn test_socket_requires_init_first() {
    let addr = start_server(false).await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({ "type": "ping" })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "connection_error");
    assert_eq!(reply["error"]["kind"], "Authentication");
}

#[tokio::test]
async fn test_pings_do_not_extend_handshake_deadline() {
    let addr = start_server_with(|config| {
        config.gateway.init_timeout = Duration::from_millis(300);
    })
    .await;
    let mut ws = connect(addr).await;

    let start = std::time::Instant::now();
    let reply = loop {
        assert!(start.elapsed() < Duration::from_secs(3), "socket outlived its handshake deadline");
        // The server may already have hung up; its reply is still buffered
        let _ = ws.send(Message::Ping(b"keepalive".to_vec())).await;
        match timeout(Duration::from_millis(50), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => break serde_json::from_str::<Value>(&text).unwrap(),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break json!({ "type": "closed" }),
            Ok(Some(Ok(_))) | Err(_) => continue,
            Ok(Some(Err(e))) => panic!("socket error: {}", e),
        }
    };

    assert_eq!(reply["type"], "connection_error");
    assert_eq!(reply["error"]["kind"], "Authentication");
}

#[tokio::test]
async fn test_socket_rejects_bad_token() {
    let addr = start_server(false).await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({ "type": "connection_init", "payload": { "token": "sess-nope.nope" } })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "connection_error");
    assert_eq!(next_json(&mut ws).await["type"], "closed");
}

#[tokio::test]
async fn test_message_flow_end_to_end() {
    let addr = start_server(false).await;
    let (ann_token, _) = signup(addr, "Ann").await;
    let (bob_token, bob_id) = signup(addr, "Bob").await;
    let (carl_token, _) = signup(addr, "Carl").await;

    let mut bob_ws = open_session(addr, &bob_token).await;
    send(&mut bob_ws, json!({ "type": "subscribe", "id": "g", "payload": { "topic": "groupAdded" } })).await;
    assert_eq!(next_json(&mut bob_ws).await["type"], "subscribed");

    let (status, body) =
        mutation(addr, Some(&ann_token), "createGroup", json!({ "name": "room", "memberIds": [bob_id] }))
            .await;
    assert_eq!(status, 200, "{}", body);
    let group_id = body["data"]["id"].as_i64().unwrap();

    let added = next_json(&mut bob_ws).await;
    assert_eq!(added["type"], "next");
    assert_eq!(added["id"], "g");
    assert_eq!(added["payload"]["topic"], "groupAdded");
    assert_eq!(added["payload"]["data"]["group"]["id"], group_id);

    send(
        &mut bob_ws,
        json!({ "type": "subscribe", "id": "m", "payload": { "topic": "messageAdded", "args": { "groupIds": [group_id] } } }),
    )
    .await;
    assert_eq!(next_json(&mut bob_ws).await["type"], "subscribed");

    let mut carl_ws = open_session(addr, &carl_token).await;
    send(
        &mut carl_ws,
        json!({ "type": "subscribe", "id": "m", "payload": { "topic": "messageAdded", "args": { "groupIds": [group_id] } } }),
    )
    .await;
    let rejected = next_json(&mut carl_ws).await;
    assert_eq!(rejected["type"], "error");
    assert_eq!(rejected["error"]["kind"], "Forbidden");

    let (status, body) =
        mutation(addr, Some(&ann_token), "createMessage", json!({ "groupId": group_id, "text": "hi bob" }))
            .await;
    assert_eq!(status, 200, "{}", body);

    let delivered = next_json(&mut bob_ws).await;
    assert_eq!(delivered["type"], "next");
    assert_eq!(delivered["id"], "m");
    assert_eq!(delivered["payload"]["topic"], "messageAdded");
    assert_eq!(delivered["payload"]["data"], body["data"]);

    send(&mut bob_ws, json!({ "type": "complete", "id": "m" })).await;
    let done = next_json(&mut bob_ws).await;
    assert_eq!(done["type"], "complete");
    assert_eq!(done["id"], "m");

    send(&mut bob_ws, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut bob_ws).await["type"], "pong");
}

#[tokio::test]
async fn test_logout_closes_live_sockets_when_enabled() {
    let addr = start_server(true).await;
    let (ann_token, _) = signup(addr, "Ann").await;

    let mut ws = open_session(addr, &ann_token).await;

    let (status, body) = mutation(addr, Some(&ann_token), "logout", Value::Null).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["data"], true);

    assert_eq!(next_json(&mut ws).await["type"], "closed");

    let (status, _) = query(addr, Some(&ann_token), "me", Value::Null).await;
    assert_eq!(status, 401);
}
