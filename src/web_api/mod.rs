//! WebAPI - HTTP/WebSocket Transport Adapter
//!
//! ## Responsibilities
//!
//! - HTTP routes (health, state snapshot)
//! - WebSocket sessions (auth, request loop, outbound pump)
//! - Bearer token extraction

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::models::HealthResponse;
use crate::permission::UserContext;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        cells: state.store.len(),
        dispatcher: state.dispatcher.stats(),
        pending_writes: state.persistence.pending_count(),
        persistence_failures: state.persistence.failure_count(),
    };

    Json(response)
}

/// Resolve the requester from an `Authorization: Bearer <token>` header
pub(crate) fn bearer_context(state: &AppState, headers: &HeaderMap) -> Result<UserContext> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;

    state
        .auth
        .authenticate(token.trim())
        .ok_or_else(|| Error::Unauthorized("invalid token".to_string()))
}
