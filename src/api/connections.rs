//! Connection statistics endpoint

use std::sync::Arc;

use axum::{Json, Router, extract::State, middleware, routing::get};
use serde::Serialize;

use super::ApiState;
use super::auth::require_api_key;
use crate::registry::ConnectionStats;

/// Registry and queue statistics
#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub total: usize,
    pub connections: Vec<ConnectionStats>,
    pub queued_critical: usize,
    pub queued_normal: usize,
}

/// Build connection routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_connections))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn list_connections(State(state): State<Arc<ApiState>>) -> Json<ConnectionsResponse> {
    let connections = state.registry.stats().await;
    let (queued_critical, queued_normal) = state.dispatcher.queue_depth().await;
    Json(ConnectionsResponse {
        total: connections.len(),
        connections,
        queued_critical,
        queued_normal,
    })
}
