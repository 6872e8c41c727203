//! HTTP routes
//!
//! - `POST /query`, `POST /mutation`: `{ "operation", "input" }` in,
//!   `{ "data": ... }` or `{ "error": { "kind", "message" } }` out
//! - `GET /ws`: subscription socket
//! - `GET /health`: liveness and store reachability

use crate::auth::{bearer_token, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::server::dispatch::Dispatcher;
use crate::server::gateway::Gateway;
use crate::server::protocol::{Mutation, OperationRequest, Query};
use crate::server::websocket::ws_handler;
use crate::storage::Store;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub gateway: Gateway,
    pub store: Arc<dyn Store>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .route("/mutation", post(mutation_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

async fn request_context(state: &AppState, headers: &HeaderMap) -> RequestContext {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    RequestContext::resolve(state.dispatcher.policy().tokens(), token).await
}

fn parse_request(body: &[u8]) -> ApiResult<OperationRequest> {
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("malformed request: {}", e)))
}

async fn query_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let query = Query::parse(parse_request(&body)?)?;
    let ctx = request_context(&state, &headers).await;

    let name = query.name();
    let data = state.dispatcher.query(&ctx, query).await.map_err(|e| {
        debug!(operation = name, error = %e, "Query failed");
        e
    })?;
    Ok(Json(json!({ "data": data })))
}

async fn mutation_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let mutation = Mutation::parse(parse_request(&body)?)?;
    let ctx = request_context(&state, &headers).await;

    let name = mutation.name();
    let data = state.dispatcher.mutation(&ctx, mutation).await.map_err(|e| {
        debug!(operation = name, error = %e, "Mutation failed");
        e
    })?;
    Ok(Json(json!({ "data": data })))
}
