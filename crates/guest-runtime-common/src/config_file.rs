//! Configuration file structures for the guest-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`AdminConfig`]: Admin API settings
//! - [`AppEntry`]: The guest application to serve

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = true
/// max_instances = 1000
///
/// [runtime.execution]
/// max_fuel = 500_000_000
/// timeout_ms = 30_000
///
/// [runtime.host]
/// sandbox_root = "./data"
/// database_url = "sqlite://./app.db"
///
/// [runtime.host.session]
/// ttl_secs = 3600
/// cookie_name = "session_id"
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
///
/// [app]
/// wasm = "./app.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution and host settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Guest application to load at startup.
    #[serde(default)]
    pub app: AppEntry,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        std::fs::read_to_string(path)
            .map_err(|source| ConfigFileError::Io {
                path: path.to_path_buf(),
                source,
            })
            .and_then(|content| Self::from_toml(&content))
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// `[server]`: the HTTP listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfigFile {
    /// `host:port`, e.g. `0.0.0.0:8080`.
    pub bind_addr: String,
    pub request_timeout_secs: u64,
    /// Drain in-flight requests on SIGINT/SIGTERM.
    pub graceful_shutdown: bool,
    /// Requests with a larger body are rejected with 413.
    pub max_body_bytes: usize,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 60,
            graceful_shutdown: true,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// `[admin]`: the token-protected inspection API.
///
/// Clients authenticate with the `X-Admin-Token` header.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub token: Option<String>,
    /// Mount point. Guest routes under it are shadowed while the API is on.
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            prefix: "/_admin".to_string(),
        }
    }
}

impl AdminConfig {
    /// Enabled and carrying a non-empty token.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// `[app]`: the guest to serve.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppEntry {
    pub wasm: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.request_timeout_secs, 60);
        assert!(config.server.graceful_shutdown);
        assert!(!config.admin.enabled);
        assert!(config.admin.token.is_none());
        assert_eq!(config.admin.prefix, "/_admin");
        assert!(config.app.wasm.is_none());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:3000"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        // Defaults applied
        assert_eq!(config.server.request_timeout_secs, 60);
        assert_eq!(config.runtime.host.session.ttl_secs, 3600);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            pooling_allocator = false
            max_instances = 500

            [runtime.execution]
            max_fuel = 5_000_000
            timeout_ms = 50

            [runtime.host]
            sandbox_root = "/srv/app/data"
            database_url = "sqlite::memory:"
            token_secret = "s3cret"
            verbose = true

            [runtime.host.session]
            ttl_secs = 900
            cookie_name = "sid"
            secure_cookie = true

            [runtime.host.http]
            allowed_hosts = ["api.example.com"]
            max_requests = 5

            [server]
            bind_addr = "0.0.0.0:9000"
            request_timeout_secs = 10
            graceful_shutdown = false

            [admin]
            enabled = true
            token = "secret-token"
            prefix = "/ops"

            [app]
            wasm = "./app.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(!config.runtime.engine.pooling_allocator);
        assert_eq!(config.runtime.engine.max_instances, 500);
        assert_eq!(config.runtime.execution.max_fuel, 5_000_000);
        assert_eq!(
            config.runtime.host.sandbox_root.as_deref(),
            Some("/srv/app/data")
        );
        assert_eq!(
            config.runtime.host.database_url.as_deref(),
            Some("sqlite::memory:")
        );
        assert!(config.runtime.host.verbose);
        assert_eq!(config.runtime.host.session.ttl_secs, 900);
        assert_eq!(config.runtime.host.session.cookie_name, "sid");
        assert!(config.runtime.host.session.secure_cookie);
        assert_eq!(config.runtime.host.http.allowed_hosts, ["api.example.com"]);
        assert_eq!(config.runtime.host.http.max_requests, 5);
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert!(!config.server.graceful_shutdown);
        assert!(config.admin.is_configured());
        assert_eq!(config.admin.prefix, "/ops");
        assert_eq!(config.app.wasm.as_deref(), Some("./app.wasm"));
    }

    #[test]
    fn test_admin_config_is_configured() {
        let mut admin = AdminConfig::default();
        assert!(!admin.is_configured());

        admin.enabled = true;
        assert!(!admin.is_configured());

        admin.token = Some(String::new());
        assert!(!admin.is_configured());

        admin.token = Some("token".to_string());
        assert!(admin.is_configured());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = ConfigFile::from_toml("this is not valid toml [").unwrap_err();

        assert!(matches!(err, ConfigFileError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigFile::from_file("/nonexistent/guest-runtime.toml").unwrap_err();

        assert!(matches!(err, ConfigFileError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/guest-runtime.toml"));
    }

    #[test]
    fn test_unknown_sections_are_ignored() {
        let config = ConfigFile::from_toml("[metrics]\nenabled = true\n").unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
    }
}
