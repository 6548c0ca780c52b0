//! Shared application state.
//!
//! This module provides [`AppState`], which holds the bootstrapped guest and
//! the shared resources every HTTP handler reads.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use guest_runtime_common::{RuntimeConfig, RuntimeError};
use guest_runtime_core::{CompiledModule, HostServices, RequestLifecycle, SessionStore, WasmEngine};
use guest_runtime_host::{create_instance_runner, host_services};

/// Shared state across all request handlers.
///
/// Cloned for each request, so everything lives behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    engine: WasmEngine,
    lifecycle: Arc<RequestLifecycle>,
    sessions: Arc<SessionStore>,
    sweep_interval: Duration,
    started_at: Instant,
}

impl AppState {
    /// Compile the guest at `path`, collect its routes and wire the host.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be created, the guest is invalid, a
    /// configured collaborator cannot be reached or the startup instance fails.
    pub async fn from_file(config: &RuntimeConfig, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&config.engine)?;
        let module = CompiledModule::from_file(engine.inner(), path)?;
        Self::bootstrap(config, engine, module).await
    }

    /// Same as [`AppState::from_file`] for a guest written in WAT.
    pub async fn from_wat(config: &RuntimeConfig, wat: &str) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&config.engine)?;
        let module = CompiledModule::from_wat(engine.inner(), wat)?;
        Self::bootstrap(config, engine, module).await
    }

    async fn bootstrap(
        config: &RuntimeConfig,
        engine: WasmEngine,
        module: CompiledModule,
    ) -> Result<Self, RuntimeError> {
        let sessions = Arc::new(SessionStore::new(config.host.session.ttl_secs));
        let services = host_services(&config.host, sessions.clone())?;
        let runner = create_instance_runner(engine.clone(), config.execution.clone())?;

        let lifecycle = RequestLifecycle::bootstrap(Arc::new(runner), module, services).await?;
        info!(
            routes = lifecycle.routes().len(),
            content_hash = %lifecycle.module().content_hash(),
            "Guest application loaded"
        );

        Ok(Self {
            engine,
            lifecycle: Arc::new(lifecycle),
            sessions,
            sweep_interval: config.host.session.sweep_interval(),
            started_at: Instant::now(),
        })
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn lifecycle(&self) -> &RequestLifecycle {
        &self.lifecycle
    }

    pub fn services(&self) -> &HostServices {
        self.lifecycle.services()
    }

    /// The session store, for sweeping and admin views.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// How often expired sessions are swept.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("routes", &self.lifecycle.routes().len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use guest_runtime_common::{EngineConfig, RouteError};

    /// A guest with `GET /health` and `GET /boom`.
    pub(crate) const HEALTH_WAT: &str = r#"
        (module
            (import "http" "_http_route" (func $route (param i32 i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (global $next (mut i32) (i32.const 4096))
            (func (export "malloc") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $next))
                (global.set $next (i32.add (global.get $next) (local.get $size)))
                (local.get $ptr))
            (data (i32.const 16) "GET")
            (data (i32.const 32) "/health")
            (data (i32.const 48) "/boom")
            (data (i32.const 64) "\14\00\00\00{\"status\":\"healthy\"}")
            (func (export "_start")
                (drop (call $route (i32.const 16) (i32.const 3) (i32.const 32) (i32.const 7) (i32.const 0)))
                (drop (call $route (i32.const 16) (i32.const 3) (i32.const 48) (i32.const 5) (i32.const 1))))
            (func (export "__route_handler_0") (result i32) (i32.const 64))
            (func (export "__route_handler_1") unreachable)
        )
    "#;

    pub(crate) fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                epoch_interruption: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bootstrap_collects_routes() {
        let state = AppState::from_wat(&test_config(), HEALTH_WAT).await.unwrap();

        assert_eq!(state.lifecycle().routes().len(), 2);
        assert!(state.sessions().is_empty());
        assert!(format!("{state:?}").contains("routes: 2"));
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_invalid_guest() {
        let wat = r#"(module (func (export "_start")))"#;
        let err = AppState::from_wat(&test_config(), wat).await.unwrap_err();

        assert!(matches!(err, RuntimeError::InvalidGuest { .. }));
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_negative_handler_index() {
        let wat = r#"
            (module
                (import "http" "_http_route" (func $route (param i32 i32 i32 i32 i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "malloc") (param i32) (result i32) (i32.const 4096))
                (data (i32.const 16) "GET")
                (data (i32.const 32) "/")
                (func (export "_start")
                    (drop (call $route (i32.const 16) (i32.const 3) (i32.const 32) (i32.const 1) (i32.const -1))))
                (func (export "__route_handler_0") (result i32) (i32.const 0))
            )
        "#;
        let err = AppState::from_wat(&test_config(), wat).await.unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::Route(RouteError::InvalidHandler { index: -1, .. })
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_missing_file() {
        let err = AppState::from_file(&test_config(), "/nonexistent/app.wasm")
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Io(_)));
    }
}
