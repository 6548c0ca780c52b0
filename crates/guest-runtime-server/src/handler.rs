//! Request handler that forwards every non-admin request to the guest.
//!
//! The guest owns routing, so this handler is installed as the router
//! fallback. It converts the request, runs it through the request lifecycle
//! and assembles the sealed envelope into the transport response.

use std::time::Instant;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::request::Parts;
use axum::response::Response;
use bytes::Bytes;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use guest_runtime_core::LifecycleState;

use crate::request::from_parts;
use crate::response::assemble;
use crate::state::AppState;

/// Header carrying the per-request id back to the client.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Run one request through the guest application.
#[instrument(skip_all, fields(method = %parts.method, path = %parts.uri.path()))]
pub async fn handle_request(State(state): State<AppState>, parts: Parts, body: Bytes) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let context = from_parts(&parts, &body);
    let outcome = state.lifecycle().handle(&request_id, context).await;

    let status = outcome.response.status();
    let fuel = outcome.metrics.as_ref().map_or(0, |m| m.fuel_consumed);
    match outcome.state {
        LifecycleState::Errored => warn!(
            request_id = %request_id,
            status,
            failed_in = ?outcome.failed_in,
            duration_ms = start.elapsed().as_millis(),
            "Request failed"
        ),
        _ => info!(
            request_id = %request_id,
            status,
            fuel_consumed = fuel,
            duration_ms = start.elapsed().as_millis(),
            "Request completed"
        ),
    }

    let mut response = assemble(&outcome.response);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
