//! Bearer key authentication for operator and agent routes

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use secrecy::{ExposeSecret, SecretString};

use super::ApiState;
use crate::config::ApiServerConfig;
use crate::Error;

/// How protected routes authenticate callers
pub enum ApiAuth {
    /// Require `Authorization: Bearer <key>`
    Key(SecretString),
    /// No key configured and unauthenticated access explicitly allowed
    Disabled,
}

impl ApiAuth {
    /// Resolve the auth mode from server configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no key is configured and unauthenticated
    /// access was not allowed, or if the configured key is empty
    pub fn from_config(config: &ApiServerConfig) -> crate::Result<Self> {
        match &config.api_key {
            Some(key) if key.is_empty() => {
                Err(Error::Config("API key must not be empty".to_string()))
            }
            Some(key) => Ok(Self::Key(SecretString::from(key.clone()))),
            None if config.allow_unauthenticated => {
                tracing::warn!("no API key configured, agent and operator routes are unauthenticated");
                Ok(Self::Disabled)
            }
            None => Err(Error::Config(
                "no API key configured; set FLEET_API_KEY or FLEET_ALLOW_UNAUTHENTICATED=1".to_string(),
            )),
        }
    }

    /// Whether a key is enforced
    #[must_use]
    pub const fn is_enforced(&self) -> bool {
        matches!(self, Self::Key(_))
    }
}

/// Extract API key from Authorization header
fn extract_api_key(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Middleware to verify API key
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ApiAuth::Key(expected) = &state.auth else {
        return Ok(next.run(req).await);
    };

    match extract_api_key(&req) {
        Some(key) if constant_time_eq(key.as_bytes(), expected.expose_secret().as_bytes()) => {
            Ok(next.run(req).await)
        }
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!(path = %req.uri().path(), "no API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
