//! Error types for the guest-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for the runtime and the request lifecycle
//! - [`MemoryError`]: Guest linear-memory marshalling failures
//! - [`RouteError`]: Route pattern compilation and registration failures
//! - [`DatabaseError`]: Failures reported by the database collaborator
//! - [`HostFunctionError`]: Errors from capability implementations

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// serving a request, from loading the guest to reading back its response.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The guest binary does not satisfy the host ABI.
    #[error("Invalid guest module: {reason}")]
    InvalidGuest {
        /// Description of the missing or malformed export.
        reason: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// No registered route matches the request.
    #[error("No route for {method} {path}")]
    RouteNotFound {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// A protected route was requested without a valid session.
    #[error("Authentication required")]
    AuthRequired,

    /// The session's role does not satisfy the route.
    #[error("Permission denied: role '{required}' required")]
    PermissionDenied {
        /// Role the route requires.
        required: String,
    },

    /// The guest handler failed while executing.
    #[error("{message}")]
    HandlerFault {
        /// Root-cause message, safe to show to clients.
        message: String,
    },

    /// Execution exceeded the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Guest memory marshalling failed.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Route registration failed.
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    /// Database collaborator failed.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Guest linear-memory marshalling errors.
///
/// These are local and recoverable: capability calls convert them into safe
/// defaults instead of aborting the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// `ptr + len` falls outside the guest's linear memory.
    #[error("Out of bounds: ptr={ptr} len={len} memory_size={memory_size}")]
    OutOfBounds {
        /// Requested offset.
        ptr: i64,
        /// Requested length.
        len: i64,
        /// Size of linear memory in bytes.
        memory_size: usize,
    },

    /// The guest allocator returned a null pointer.
    #[error("Allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
    },

    /// A required export is missing from the guest instance.
    #[error("Missing export: {name}")]
    MissingExport {
        /// Export name (or alternatives) that was looked up.
        name: String,
    },

    /// Calling into the guest (allocator or deallocator) trapped.
    #[error("Guest call failed: {message}")]
    GuestCall {
        /// Description of the failure.
        message: String,
    },
}

/// Route registration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The pattern contains malformed special characters.
    #[error("Invalid route pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The raw pattern.
        pattern: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The handler index is negative and names no `__route_handler_<n>` export.
    #[error("Invalid handler index {index} for {method} {pattern}")]
    InvalidHandler {
        /// Method of the rejected registration.
        method: String,
        /// Pattern of the rejected registration.
        pattern: String,
        /// The index the guest passed.
        index: i32,
    },

    /// A registration arrived after the route table was frozen.
    #[error("Route table is frozen; cannot register {method} {pattern}")]
    TableFrozen {
        /// Method of the rejected registration.
        method: String,
        /// Pattern of the rejected registration.
        pattern: String,
    },
}

/// Errors reported by the database collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// No database driver is configured.
    #[error("Database unavailable: no driver configured")]
    Unavailable,

    /// The referenced transaction id is unknown to the driver.
    #[error("Transaction not found: {id}")]
    TransactionNotFound {
        /// The unknown transaction id.
        id: String,
    },

    /// The connection string names an engine with no driver.
    #[error("Unsupported database scheme: {scheme}")]
    UnsupportedScheme {
        /// The scheme portion of the URL.
        scheme: String,
    },

    /// The engine rejected a statement or connection.
    #[error("Query failed: {message}")]
    Query {
        /// Engine error message.
        message: String,
    },
}

/// Errors from capability implementations.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// An HTTP request made by the guest module failed.
    #[error("HTTP request failed: {url} (status: {status})")]
    HttpRequestFailed {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code (0 if connection failed).
        status: u16,
    },

    /// The requested operation was denied by the permission system.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// A file path resolved outside the sandbox root.
    #[error("Sandbox violation: {path}")]
    SandboxViolation {
        /// The offending guest path.
        path: String,
    },

    /// Rate limit for host function calls was exceeded.
    #[error("Rate limit exceeded: {operation}")]
    RateLimitExceeded {
        /// The operation that was rate-limited.
        operation: String,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `InvalidGuest` error.
    pub fn invalid_guest(reason: impl Into<String>) -> Self {
        Self::InvalidGuest {
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `RouteNotFound` error.
    pub fn route_not_found(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::RouteNotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Create a new `HandlerFault` error.
    pub fn handler_fault(message: impl Into<String>) -> Self {
        Self::HandlerFault {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// HTTP status code for this error when it reaches a client.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RouteNotFound { .. } => 404,
            Self::AuthRequired => 401,
            Self::PermissionDenied { .. } => 403,
            Self::FuelExhausted => 429,
            Self::ExecutionTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Stable machine-readable error code for the JSON error envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::FuelExhausted => "EXECUTION_LIMIT",
            Self::ExecutionTimeout { .. } => "TIMEOUT",
            _ => "HANDLER_FAULT",
        }
    }

    /// Message that may be shown to clients.
    ///
    /// Only errors raised by the lifecycle itself carry their own text;
    /// everything else collapses to a generic message so configuration and
    /// I/O details stay in the server logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::RouteNotFound { .. }
            | Self::AuthRequired
            | Self::PermissionDenied { .. }
            | Self::HandlerFault { .. }
            | Self::FuelExhausted
            | Self::ExecutionTimeout { .. }
            | Self::Memory(_) => self.to_string(),
            _ => "Internal server error".to_string(),
        }
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::ExecutionTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::route_not_found("GET", "/missing");
        assert_eq!(err.to_string(), "No route for GET /missing");

        let err = RuntimeError::FuelExhausted;
        assert_eq!(err.to_string(), "Fuel exhausted: CPU limit exceeded");
    }

    #[test]
    fn test_error_from_memory() {
        let mem_err = MemoryError::AllocationFailed { size: 16 };
        let runtime_err: RuntimeError = mem_err.into();

        assert!(matches!(runtime_err, RuntimeError::Memory(_)));
        assert_eq!(runtime_err.status_code(), 500);
    }

    #[test]
    fn test_status_and_code_mapping() {
        let cases = [
            (RuntimeError::route_not_found("GET", "/"), 404, "ROUTE_NOT_FOUND"),
            (RuntimeError::AuthRequired, 401, "AUTH_REQUIRED"),
            (
                RuntimeError::PermissionDenied {
                    required: "admin".into(),
                },
                403,
                "PERMISSION_DENIED",
            ),
            (RuntimeError::handler_fault("boom"), 500, "HANDLER_FAULT"),
            (RuntimeError::FuelExhausted, 429, "EXECUTION_LIMIT"),
            (
                RuntimeError::ExecutionTimeout { duration_ms: 10 },
                504,
                "TIMEOUT",
            ),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status, "{err}");
            assert_eq!(err.error_code(), code, "{err}");
        }
    }

    #[test]
    fn test_public_message_hides_internal_details() {
        let err = RuntimeError::invalid_config("secret path /etc/app.toml");
        assert_eq!(err.public_message(), "Internal server error");

        let err = RuntimeError::handler_fault("wasm trap: unreachable");
        assert_eq!(err.public_message(), "wasm trap: unreachable");
    }

    #[test]
    fn test_is_resource_limit() {
        assert!(RuntimeError::FuelExhausted.is_resource_limit());
        assert!(RuntimeError::ExecutionTimeout { duration_ms: 100 }.is_resource_limit());
        assert!(!RuntimeError::AuthRequired.is_resource_limit());
    }

    #[test]
    fn test_route_error_display() {
        let err = RouteError::TableFrozen {
            method: "GET".into(),
            pattern: "/late".into(),
        };
        assert_eq!(
            err.to_string(),
            "Route table is frozen; cannot register GET /late"
        );
    }
}
