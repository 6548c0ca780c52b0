//! Common types, errors, and configuration for guest-runtime.
//!
//! This crate provides shared functionality used across the guest-runtime workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine, execution limits and host capabilities
//! - The TOML configuration file format

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    EngineConfig, ExecutionConfig, HostConfig, OutboundHttpConfig, RuntimeConfig, SessionConfig,
};
pub use config_file::{AdminConfig, AppEntry, ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{
    DatabaseError, HostFunctionError, MemoryError, RouteError, RuntimeError, RuntimeResult,
};
