//! HTTP server implementation.
//!
//! This module provides the main [`GuestServer`] struct for serving a
//! bootstrapped guest application, together with the background tasks that
//! run next to it: the session sweeper and, when epoch interruption is
//! enabled, the epoch ticker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use guest_runtime_common::{AdminConfig, RuntimeError, ServerConfigFile};
use guest_runtime_core::{SessionStore, WasmEngine};

use crate::router::{AdminRouterConfig, build_router};
use crate::state::AppState;

/// Period of the epoch ticker. Execution deadlines are counted in ticks.
pub const EPOCH_TICK: Duration = Duration::from_millis(1);

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Admin API, when enabled.
    pub admin: Option<AdminRouterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 60,
            graceful_shutdown: true,
            max_body_bytes: 10 * 1024 * 1024,
            admin: None,
        }
    }
}

impl ServerConfig {
    /// Build the server config from the `[server]` and `[admin]` sections.
    ///
    /// # Errors
    ///
    /// Fails on an unparsable bind address, an enabled admin API without a
    /// token, or an admin prefix of `/`.
    pub fn from_file(server: &ServerConfigFile, admin: &AdminConfig) -> Result<Self, RuntimeError> {
        let bind_addr = server.bind_addr.parse().map_err(|e| {
            RuntimeError::invalid_config(format!("Invalid bind address '{}': {e}", server.bind_addr))
        })?;

        let admin = match (admin.enabled, &admin.token) {
            (false, _) => None,
            (true, None) => {
                return Err(RuntimeError::invalid_config("Admin API is enabled but no token is set"));
            }
            (true, Some(token)) => Some(AdminRouterConfig {
                prefix: normalize_prefix(&admin.prefix)?,
                token: token.clone(),
            }),
        };

        Ok(Self {
            bind_addr,
            request_timeout_secs: server.request_timeout_secs,
            graceful_shutdown: server.graceful_shutdown,
            max_body_bytes: server.max_body_bytes,
            admin,
        })
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Enable the Admin API under `prefix`.
    pub fn with_admin(mut self, prefix: impl Into<String>, token: impl Into<String>) -> Self {
        self.admin = Some(AdminRouterConfig {
            prefix: prefix.into(),
            token: token.into(),
        });
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn normalize_prefix(prefix: &str) -> Result<String, RuntimeError> {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(RuntimeError::invalid_config("Admin prefix cannot be the root path"));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}

/// Guest runtime HTTP server.
///
/// # Example
///
/// ```ignore
/// use guest_runtime_server::{AppState, GuestServer, ServerConfig};
/// use guest_runtime_common::RuntimeConfig;
///
/// let state = AppState::from_file(&RuntimeConfig::default(), "app.wasm").await?;
/// GuestServer::new(state, ServerConfig::default()).run().await?;
/// ```
pub struct GuestServer {
    state: AppState,
    config: ServerConfig,
}

impl GuestServer {
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// Background tasks stop once the listener has drained, then the
    /// database driver, if any, is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let app = build_router(self.state.clone(), &self.config);

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");
        if let Some(admin) = &self.config.admin {
            info!(prefix = %admin.prefix, "Admin API enabled");
        }

        let tasks = BackgroundTasks::spawn(&self.state);

        let served = if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        } else {
            axum::serve(listener, app).await
        };

        drop(tasks);
        close_database(&self.state).await;

        served.map_err(|e| RuntimeError::invalid_config(format!("Server error: {e}")))?;
        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral port and return a handle for testing.
    pub async fn start_test(state: AppState, config: ServerConfig) -> Result<TestHandle, RuntimeError> {
        let app = build_router(state.clone(), &config);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let tasks = BackgroundTasks::spawn(&state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
            _tasks: tasks,
        })
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), std::io::Error>>,
    _tasks: BackgroundTasks,
}

impl TestHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
        close_database(&self.state).await;
    }
}

/// Tasks that live as long as the server. Dropping the set aborts them.
struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn spawn(state: &AppState) -> Self {
        let mut handles = vec![spawn_session_sweeper(
            Arc::clone(state.sessions()),
            state.sweep_interval(),
        )];

        if state.engine().config().epoch_interruption {
            handles.push(spawn_epoch_ticker(state.engine().clone(), EPOCH_TICK));
        }

        Self { handles }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Periodically remove expired sessions.
pub fn spawn_session_sweeper(sessions: Arc<SessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            let removed = sessions.sweep_expired();
            if removed > 0 {
                debug!(removed, remaining = sessions.len(), "Expired sessions swept");
            }
        }
    })
}

/// Advance the engine epoch every `tick` so deadlines fire.
pub fn spawn_epoch_ticker(engine: WasmEngine, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            engine.increment_epoch();
        }
    })
}

async fn close_database(state: &AppState) {
    let Ok(database) = state.services().database() else {
        return;
    };
    if let Err(e) = database.close().await {
        warn!(error = %e, "Failed to close database");
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
