//! Agent-facing endpoints
//!
//! WebSocket upgrade for live connections, plus the fallback poll channel
//! used when an agent has no live connection.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::auth::require_api_key;
use super::{ApiError, ApiState, api_error, error_response};
use crate::command::{CommandResult, CommandStatus, OutboundCommand, Transition};
use crate::inbound::InboundMessage;
use crate::registry::{Frame, FrameSink};
use crate::{Error, Result};

/// Query parameters identifying an agent
#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub hostname: String,
}

/// Commands handed to a polling agent
#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub commands: Vec<OutboundCommand>,
}

/// Completion report over the poll channel
#[derive(Debug, Deserialize)]
pub struct ResultReport {
    pub hostname: String,
    pub status: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Outcome of a completion report
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportResponse {
    pub command_id: String,
    pub status: CommandStatus,
    /// True when the command was already terminal and the report was ignored
    pub duplicate: bool,
}

/// Build poll-channel routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/commands", get(poll_commands))
        .route("/commands/{command_id}/result", post(report_result))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Build agent WebSocket router
pub fn ws_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/agent", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Resolve the agent in the inventory, refusing unknown hosts
async fn known_agent(state: &ApiState, hostname: &str) -> std::result::Result<(), ApiError> {
    if hostname.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            error_response("rejected", "hostname is required"),
        ));
    }
    match state.inventory.get_by_identity(hostname).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(api_error(&Error::UnknownAgent(hostname.to_string()))),
        Err(e) => Err(api_error(&e)),
    }
}

/// Handle WebSocket upgrade for agent connections
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(rejection) = known_agent(&state, &query.hostname).await {
        tracing::warn!(hostname = %query.hostname, "refusing connection from unknown agent");
        return rejection.into_response();
    }

    let hostname = query.hostname;
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, hostname))
}

/// Write half of an agent WebSocket
struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping => Message::Ping(Bytes::new()),
            Frame::Close => Message::Close(None),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

fn to_inbound(message: Message) -> InboundMessage {
    match message {
        Message::Text(text) => InboundMessage::Text(text.to_string()),
        Message::Binary(bytes) => InboundMessage::Binary(bytes.to_vec()),
        Message::Ping(_) => InboundMessage::Ping,
        Message::Pong(_) => InboundMessage::Pong,
        Message::Close(_) => InboundMessage::Close,
    }
}

/// Register the socket and run its read loop until it ends
async fn handle_agent_socket(socket: WebSocket, state: Arc<ApiState>, hostname: String) {
    let (sender, receiver) = socket.split();
    let conn = state
        .registry
        .register(&hostname, Box::new(WsSink { sink: sender }))
        .await;

    let stream = receiver.map(|message| {
        message
            .map(to_inbound)
            .map_err(|e| Error::Transport(e.to_string()))
    });
    state.router.run(conn, stream).await;

    tracing::debug!(hostname = %hostname, "agent socket handler finished");
}

/// Hand every parked command to a polling agent
async fn poll_commands(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AgentQuery>,
) -> std::result::Result<Json<PollResponse>, ApiError> {
    known_agent(&state, &query.hostname).await?;

    let envelopes = state
        .pending
        .drain_for_poll(&query.hostname)
        .await
        .map_err(|e| api_error(&e))?;

    // Retrieval by the agent counts as receipt
    let states = state.dispatcher.states();
    for envelope in &envelopes {
        states.acknowledge(envelope.id()).await;
    }

    if !envelopes.is_empty() {
        tracing::info!(hostname = %query.hostname, count = envelopes.len(), "delivered commands over poll channel");
    }

    Ok(Json(PollResponse {
        commands: envelopes.iter().map(OutboundCommand::from).collect(),
    }))
}

/// Accept a completion report from a polling agent
async fn report_result(
    State(state): State<Arc<ApiState>>,
    Path(command_id): Path<String>,
    Json(report): Json<ResultReport>,
) -> std::result::Result<Json<ReportResponse>, ApiError> {
    let failed = match report.status.as_str() {
        "completed" => false,
        "failed" => true,
        other => {
            return Err(api_error(&Error::Rejected(format!(
                "status must be 'completed' or 'failed', got '{other}'"
            ))));
        }
    };

    let result = CommandResult {
        success: report.success.unwrap_or(!failed),
        message: report.message.unwrap_or_default(),
        details: report.details,
    };

    match state
        .router
        .apply_completion(&report.hostname, &command_id, result, failed)
        .await
    {
        Transition::Applied(command) => Ok(Json(ReportResponse {
            command_id,
            status: command.status,
            duplicate: false,
        })),
        Transition::Unchanged(status) => Ok(Json(ReportResponse {
            command_id,
            status,
            duplicate: true,
        })),
        Transition::Unknown => Err(api_error(&Error::NotFound(format!(
            "command {command_id} for {}",
            report.hostname
        )))),
    }
}
