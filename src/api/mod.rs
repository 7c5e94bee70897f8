//! HTTP API server for the fleet dispatcher

pub mod agents;
mod auth;
pub mod commands;
pub mod connections;
pub mod health;
pub mod nodes;

pub use auth::ApiAuth;

use std::sync::Arc;

use axum::{Json, Router, http::StatusCode};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::collaborators::{Inventory, PendingStore};
use crate::dispatch::Dispatcher;
use crate::inbound::InboundRouter;
use crate::registry::ConnectionRegistry;
use crate::{Error, Result};

/// Shared state for API handlers
pub struct ApiState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Arc<InboundRouter>,
    pub inventory: Arc<dyn Inventory>,
    pub pending: Arc<dyn PendingStore>,
    /// Bearer key policy for every route except health
    pub auth: ApiAuth,
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Error half of every handler result
pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(code: &str, message: &str) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
        },
    })
}

/// Map a crate error onto an HTTP status and error body
fn api_error(e: &Error) -> ApiError {
    let (status, code) = match e {
        Error::Rejected(_) => (StatusCode::BAD_REQUEST, "rejected"),
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::UnknownAgent(_) => (StatusCode::NOT_FOUND, "unknown_agent"),
        Error::NotCancelable { .. } => (StatusCode::CONFLICT, "not_cancelable"),
        Error::Transport(_) => (StatusCode::BAD_GATEWAY, "transport_error"),
        Error::Database(_) | Error::Sqlite(_) => (StatusCode::INTERNAL_SERVER_ERROR, "db_error"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "request failed");
    }
    (status, error_response(code, &e.to_string()))
}

/// HTTP API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: Arc<ApiState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .nest("/api/commands", commands::router(self.state.clone()))
            .nest("/api/nodes", nodes::router(self.state.clone()))
            .nest("/api/connections", connections::router(self.state.clone()))
            .nest("/api/agent", agents::router(self.state.clone()))
            .nest("/ws", agents::ws_router(self.state.clone()))
            .merge(health::router());

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Spawn the API server in the background
    pub fn spawn(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
