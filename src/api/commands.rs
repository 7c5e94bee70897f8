//! Operator command endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use serde::Deserialize;

use super::auth::require_api_key;
use super::{ApiError, ApiState, api_error};
use crate::Error;
use crate::command::{CommandEnvelope, CommandKind, CommandState, Priority, Target};

/// Request body for submitting a command
#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    /// Idempotency key; generated when absent
    #[serde(default)]
    pub command_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub target_node: Option<String>,
    #[serde(default)]
    pub target_group: Option<String>,
}

impl SubmitCommandRequest {
    fn into_envelope(self) -> crate::Result<CommandEnvelope> {
        let kind: CommandKind = self.command.parse()?;
        let target = Target::from_parts(self.target_node, self.target_group)?;
        let id = self
            .command_id
            .unwrap_or_else(|| format!("cmd-{}", uuid::Uuid::new_v4()));
        CommandEnvelope::new(id, kind, self.priority, self.details, target)
    }
}

/// Build command routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", post(submit_command))
        .route("/{command_id}", get(get_command).delete(cancel_command))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn submit_command(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SubmitCommandRequest>,
) -> Result<(StatusCode, Json<CommandState>), ApiError> {
    let envelope = req.into_envelope().map_err(|e| api_error(&e))?;
    let command = state
        .dispatcher
        .submit(envelope)
        .await
        .map_err(|e| api_error(&e))?;
    Ok((StatusCode::ACCEPTED, Json(command)))
}

async fn get_command(
    State(state): State<Arc<ApiState>>,
    Path(command_id): Path<String>,
) -> Result<Json<CommandState>, ApiError> {
    state
        .dispatcher
        .states()
        .get(&command_id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(&Error::NotFound(format!("command {command_id}"))))
}

async fn cancel_command(
    State(state): State<Arc<ApiState>>,
    Path(command_id): Path<String>,
) -> Result<Json<CommandState>, ApiError> {
    state
        .dispatcher
        .cancel(&command_id)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}
