//! HTTP router configuration.
//!
//! The guest owns the URL space: every request that is not under the admin
//! prefix reaches [`handle_request`] through the router fallback.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminState, build_admin_router};
use crate::handler::handle_request;
use crate::server::ServerConfig;
use crate::state::AppState;

/// Admin API configuration for router.
#[derive(Debug, Clone)]
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/_admin").
    pub prefix: String,
    pub token: String,
}

/// Build the application router.
///
/// Admin routes, when configured, take precedence over guest routes under
/// the same prefix.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let mut router = Router::new();

    if let Some(admin) = &config.admin {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: admin.token.clone(),
        };
        router = router.nest(&admin.prefix, build_admin_router(admin_state));
    }

    router
        .fallback(handle_request)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout()))
        .with_state(state)
}
