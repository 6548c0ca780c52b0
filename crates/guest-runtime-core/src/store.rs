//! Per-instance state and store management.
//!
//! This module provides:
//! - [`GuestState`]: State owned by one guest instance, reachable from host functions
//! - [`LogEntry`] and [`LogLevel`]: Console output captured from guest code
//! - [`ExecutionMetrics`]: Instantiation and execution cost of each request
//!
//! A [`GuestState`] is created either for the startup instance, which is the only
//! instance allowed to register routes, or for exactly one inbound request.

use std::time::{Duration, Instant};

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use crate::context::{RequestContext, ResponseEnvelope};
use crate::router::{RouteSpec, RouteTableBuilder};
use crate::scope::MemoryScopes;
use crate::services::HostServices;
use guest_runtime_common::{ExecutionConfig, RouteError, RuntimeError};

/// Fuel between cooperative yields to the async executor.
const FUEL_YIELD_INTERVAL: u64 = 100_000;

/// Request id used by the startup instance.
pub const STARTUP_REQUEST_ID: &str = "startup";

/// Per-instance state.
///
/// Host functions access this through the [`wasmtime::Caller`] API. It is
/// created together with the instance and dropped with it, so nothing here
/// is ever observed by a second request.
pub struct GuestState {
    /// WASI preview1 context for toolchains that emit WASI imports.
    wasi: WasiP1Ctx,

    /// Unique request identifier for tracing.
    pub request_id: String,

    /// The inbound request; empty for the startup instance.
    pub request: RequestContext,

    /// The response being accumulated.
    pub response: ResponseEnvelope,

    /// Reference-counted guest allocations.
    pub scopes: MemoryScopes,

    /// Console output collected from guest code.
    pub logs: Vec<LogEntry>,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,

    /// Database transactions begun by this instance and not yet finished.
    pub open_transactions: Vec<String>,

    routes: RouteRegistration,

    services: HostServices,

    limits: StoreLimits,

    start_time: Instant,
}

enum RouteRegistration {
    Open(RouteTableBuilder),
    Frozen,
}

/// A single line of guest console output.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map the integer level passed by the guest (0 = debug .. 3 = error).
    pub fn from_guest(level: i32) -> Self {
        match level {
            i32::MIN..=0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed by instantiation and the handler.
    pub fuel_consumed: u64,

    /// Time spent creating the instance.
    pub instantiate: Option<Duration>,

    /// Time spent inside the handler export.
    pub execute: Option<Duration>,

    /// Total time since the state was created.
    pub duration: Option<Duration>,

    /// Outbound HTTP calls made by the guest.
    pub http_requests: u32,
}

impl GuestState {
    /// The most recently begun transaction still open, which statements
    /// from this instance run in.
    pub fn current_transaction(&self) -> Option<&str> {
        self.open_transactions.last().map(String::as_str)
    }

    fn new(
        request_id: String,
        request: RequestContext,
        routes: RouteRegistration,
        services: HostServices,
    ) -> Self {
        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();

        Self {
            wasi,
            request_id,
            request,
            response: ResponseEnvelope::new(),
            scopes: MemoryScopes::new(),
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
            open_transactions: Vec::new(),
            routes,
            services,
            limits: StoreLimits::default(),
            start_time: Instant::now(),
        }
    }

    /// State for the startup instance; route registration is open.
    pub fn for_startup(services: HostServices) -> Self {
        Self::new(
            STARTUP_REQUEST_ID.to_string(),
            RequestContext::default(),
            RouteRegistration::Open(RouteTableBuilder::new()),
            services,
        )
    }

    /// State for one inbound request; route registration is closed.
    pub fn for_request(
        request_id: impl Into<String>,
        request: RequestContext,
        services: HostServices,
    ) -> Self {
        Self::new(
            request_id.into(),
            request,
            RouteRegistration::Frozen,
            services,
        )
    }

    /// Register a route during startup.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::TableFrozen`] outside the startup instance and
    /// [`RouteError::InvalidPattern`] for malformed patterns.
    pub fn register_route(&mut self, spec: RouteSpec) -> Result<(), RouteError> {
        match &mut self.routes {
            RouteRegistration::Open(builder) => builder.register(spec),
            RouteRegistration::Frozen => Err(RouteError::TableFrozen {
                method: spec.method,
                pattern: spec.pattern,
            }),
        }
    }

    /// Take the routes registered so far and close registration.
    pub fn take_routes(&mut self) -> RouteTableBuilder {
        match std::mem::replace(&mut self.routes, RouteRegistration::Frozen) {
            RouteRegistration::Open(builder) => builder,
            RouteRegistration::Frozen => RouteTableBuilder::new(),
        }
    }

    /// Whether route registration is still open.
    pub fn is_startup(&self) -> bool {
        matches!(self.routes, RouteRegistration::Open(_))
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    /// Mutable access to the WASI context.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Record a line of guest console output.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Get elapsed time since the state was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finalize metrics after execution.
    pub fn finalize_metrics(&mut self) {
        self.metrics.duration = Some(self.start_time.elapsed());
    }
}

/// Create a new Wasmtime store around `state`.
///
/// Applies fuel, the async yield interval, the epoch deadline (one tick per
/// millisecond) and the linear-memory limit.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    mut state: GuestState,
) -> Result<Store<GuestState>, RuntimeError> {
    let max_memory = (config.max_memory_mb as usize).saturating_mul(1024 * 1024);
    state.limits = StoreLimitsBuilder::new().memory_size(max_memory).build();

    let mut store = Store::new(engine.inner(), state);
    store.limiter(|state| &mut state.limits);

    // The engine always consumes fuel; without metering the budget is unbounded.
    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    // Periodic yields let wall-clock timeouts fire even for guests that never call the host.
    store
        .fuel_async_yield_interval(Some(FUEL_YIELD_INTERVAL))
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set yield interval: {e}")))?;

    if engine.config().epoch_interruption {
        store.set_epoch_deadline(config.timeout_ms.max(1));
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<GuestState>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
