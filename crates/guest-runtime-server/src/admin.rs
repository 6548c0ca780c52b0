//! Admin API handlers for runtime inspection.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header
//! to match the configured admin token. The comparison runs in constant time.
//!
//! # Endpoints
//!
//! - `GET /routes` - List the guest's route table in registration order
//! - `GET /sessions` - List live sessions (identifiers are never exposed)
//! - `POST /sessions/sweep` - Remove expired sessions now
//! - `GET /status` - Uptime, route and session counts

use axum::{
    Extension, Json, Router,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, instrument};

use crate::state::AppState;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    pub app_state: AppState,
    /// Expected admin token for authentication.
    pub admin_token: String,
}

#[derive(Serialize)]
struct StatusInfo {
    uptime_secs: u64,
    routes: usize,
    sessions: usize,
    content_hash: String,
    pooling_allocator: bool,
    epoch_interruption: bool,
}

/// Build the Admin API router.
///
/// The admin state travels in an `Extension`, so the router nests into the
/// main router without sharing its state type.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/routes", get(list_routes))
        .route("/sessions", get(list_sessions))
        .route("/sessions/sweep", post(sweep_sessions))
        .route("/status", get(status))
        .layer(Extension(admin_state))
}

fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), (StatusCode, &'static str)> {
    let Some(token) = headers.get(ADMIN_TOKEN_HEADER) else {
        return Err((StatusCode::UNAUTHORIZED, "Missing X-Admin-Token header"));
    };

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "Invalid admin token"))
    }
}

/// `GET /routes`
///
/// ```json
/// {
///   "routes": [{ "method": "GET", "pattern": "/health", "handlerIndex": 0, "isProtected": false }],
///   "count": 1
/// }
/// ```
#[instrument(skip_all)]
pub async fn list_routes(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let routes = admin_state.app_state.lifecycle().routes().describe();
    let count = routes.len();

    Json(serde_json::json!({
        "routes": routes,
        "count": count
    }))
    .into_response()
}

/// `GET /sessions`
#[instrument(skip_all)]
pub async fn list_sessions(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let sessions = admin_state.app_state.sessions().summaries();
    let count = sessions.len();

    Json(serde_json::json!({
        "sessions": sessions,
        "count": count
    }))
    .into_response()
}

/// `POST /sessions/sweep`
///
/// ```json
/// { "removed": 3, "remaining": 10 }
/// ```
#[instrument(skip_all)]
pub async fn sweep_sessions(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let sessions = admin_state.app_state.sessions();
    let removed = sessions.sweep_expired();
    info!(removed, "Expired sessions swept on demand");

    Json(serde_json::json!({
        "removed": removed,
        "remaining": sessions.len()
    }))
    .into_response()
}

/// `GET /status`
#[instrument(skip_all)]
pub async fn status(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let state = &admin_state.app_state;
    let engine = state.engine().config();

    Json(StatusInfo {
        uptime_secs: state.uptime_secs(),
        routes: state.lifecycle().routes().len(),
        sessions: state.sessions().len(),
        content_hash: state.lifecycle().module().content_hash().to_string(),
        pooling_allocator: engine.pooling_allocator,
        epoch_interruption: engine.epoch_interruption,
    })
    .into_response()
}
