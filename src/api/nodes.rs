//! Host isolation endpoints
//!
//! Isolation bypasses the dispatch queue. The response reports whether the
//! directive reached a live connection or is waiting for the agent's next poll.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    middleware,
    routing::post,
};
use serde::{Deserialize, Serialize};

use super::auth::require_api_key;
use super::{ApiError, ApiState, api_error};
use crate::dispatch::{DeliveryOutcome, UrgentReceipt};

/// Request body for isolate/release; the body may be omitted entirely
#[derive(Debug, Default, Deserialize)]
pub struct IsolationRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Operator-facing isolation result
#[derive(Debug, Serialize, Deserialize)]
pub struct IsolationResponse {
    pub hostname: String,
    pub command_id: String,
    /// `confirmed` when delivered live, `pending_confirmation` when parked
    pub status: String,
    pub delivery: DeliveryOutcome,
}

impl IsolationResponse {
    fn new(hostname: String, receipt: UrgentReceipt) -> Self {
        let status = match receipt.outcome {
            DeliveryOutcome::DeliveredLive => "confirmed",
            DeliveryOutcome::QueuedForPoll => "pending_confirmation",
        };
        Self {
            hostname,
            command_id: receipt.command_id,
            status: status.to_string(),
            delivery: receipt.outcome,
        }
    }
}

/// Build node routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{hostname}/isolate", post(isolate))
        .route("/{hostname}/release", post(release))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn isolate(
    State(state): State<Arc<ApiState>>,
    Path(hostname): Path<String>,
    body: Option<Json<IsolationRequest>>,
) -> Result<Json<IsolationResponse>, ApiError> {
    let reason = body
        .map(|Json(req)| req)
        .unwrap_or_default()
        .reason
        .unwrap_or_else(|| "isolation requested by operator".to_string());
    let receipt = state
        .dispatcher
        .isolate_host(&hostname, &reason)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(IsolationResponse::new(hostname, receipt)))
}

async fn release(
    State(state): State<Arc<ApiState>>,
    Path(hostname): Path<String>,
    body: Option<Json<IsolationRequest>>,
) -> Result<Json<IsolationResponse>, ApiError> {
    let reason = body
        .map(|Json(req)| req)
        .unwrap_or_default()
        .reason
        .unwrap_or_else(|| "isolation lifted by operator".to_string());
    let receipt = state
        .dispatcher
        .release_host(&hostname, &reason)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(IsolationResponse::new(hostname, receipt)))
}
