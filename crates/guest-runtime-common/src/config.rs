//! Configuration structures for the guest-runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs)
//! - [`ExecutionConfig`]: Per-request execution limits (fuel, memory, timeout)
//! - [`HostConfig`]: Capability settings (sandbox, sessions, database, outbound HTTP)
//!
//! The core treats every value here as an opaque input; parsing happens in the
//! binary and in [`crate::config_file`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the guest-runtime.
/// It can be loaded from TOML files or assembled from CLI flags.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-request execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Host capability configuration.
    #[serde(default)]
    pub host: HostConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including memory allocation strategy and interruption.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// Every request instantiates a fresh guest, so this directly lowers
    /// per-request latency.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// This allows interrupting long-running guest code based on wall time
    /// rather than fuel consumption.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

/// Per-request execution configuration.
///
/// These settings control resource limits for individual guest executions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per request.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Execution timeout in milliseconds.
    ///
    /// Covers instantiation, the handler call and any host I/O it awaits.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Host capability configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostConfig {
    /// Root directory for the sandboxed file capability.
    ///
    /// When unset, every file capability fails with its safe default.
    #[serde(default)]
    pub sandbox_root: Option<String>,

    /// Database connection URL; the scheme selects the driver.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Secret used to sign and verify guest tokens.
    ///
    /// A random secret is generated at startup when unset.
    #[serde(default)]
    pub token_secret: Option<String>,

    /// Log internal error details at error level.
    #[serde(default)]
    pub verbose: bool,

    /// Session store settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Outbound HTTP settings.
    #[serde(default)]
    pub http: OutboundHttpConfig,
}

/// Session store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Default session lifetime in seconds.
    #[serde(default = "defaults::session_ttl_secs")]
    pub ttl_secs: u64,

    /// Cookie carrying the session identifier.
    #[serde(default = "defaults::cookie_name")]
    pub cookie_name: String,

    /// Interval between active expiry sweeps.
    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Mark the session cookie `Secure`.
    #[serde(default)]
    pub secure_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::session_ttl_secs(),
            cookie_name: defaults::cookie_name(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
            secure_cookie: false,
        }
    }
}

impl SessionConfig {
    /// Get the sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundHttpConfig {
    /// Host patterns the guest may call (`api.example.com`, `*.example.com`, `*`).
    ///
    /// An empty list disables outbound HTTP.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Maximum outbound requests per guest request.
    #[serde(default = "defaults::max_http_requests")]
    pub max_requests: u32,

    /// Per-call timeout in milliseconds.
    #[serde(default = "defaults::http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OutboundHttpConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            max_requests: defaults::max_http_requests(),
            timeout_ms: defaults::http_timeout_ms(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        500_000_000
    }

    pub const fn timeout_ms() -> u64 {
        30_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn session_ttl_secs() -> u64 {
        3600
    }

    pub fn cookie_name() -> String {
        "session_id".to_string()
    }

    pub const fn sweep_interval_secs() -> u64 {
        60
    }

    pub const fn max_http_requests() -> u32 {
        100
    }

    pub const fn http_timeout_ms() -> u64 {
        30_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert_eq!(config.engine.instance_memory_mb, 64);
        assert!(config.engine.epoch_interruption);

        assert_eq!(config.execution.max_fuel, 500_000_000);
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert!(config.execution.fuel_metering);

        assert_eq!(config.host.session.ttl_secs, 3600);
        assert_eq!(config.host.session.cookie_name, "session_id");
        assert!(config.host.sandbox_root.is_none());
        assert!(config.host.database_url.is_none());
        assert!(config.host.http.allowed_hosts.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.engine.max_instances,
            deserialized.engine.max_instances
        );
        assert_eq!(config.execution.max_fuel, deserialized.execution.max_fuel);
        assert_eq!(
            config.host.session.cookie_name,
            deserialized.host.session.cookie_name
        );
    }

    #[test]
    fn test_execution_timeout() {
        let config = ExecutionConfig {
            timeout_ms: 500,
            ..Default::default()
        };

        assert_eq!(config.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let config = SessionConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };

        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"engine": {"max_instances": 500}, "host": {"session": {"ttl_secs": 60}}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.engine.max_instances, 500);
        assert_eq!(config.host.session.ttl_secs, 60);
        // Default values for unspecified fields
        assert!(config.engine.pooling_allocator);
        assert_eq!(config.host.session.cookie_name, "session_id");
        assert_eq!(config.execution.max_fuel, 500_000_000);
    }
}
