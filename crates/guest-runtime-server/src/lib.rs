//! HTTP transport for guest-runtime.
//!
//! This crate puts a compiled guest application behind an HTTP listener:
//!
//! - every request is converted into a request context and run through the
//!   guest's route table by the request lifecycle
//! - the sealed response envelope is assembled into the HTTP response,
//!   cookies included
//! - an optional, token-protected Admin API exposes routes and sessions
//! - background tasks sweep expired sessions and drive execution deadlines
//!
//! # Quick Start
//!
//! ```ignore
//! use guest_runtime_common::RuntimeConfig;
//! use guest_runtime_server::{AppState, GuestServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::from_file(&RuntimeConfig::default(), "app.wasm").await?;
//!     GuestServer::new(state, ServerConfig::default()).run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use router::{AdminRouterConfig, build_router};
pub use server::{GuestServer, ServerConfig, TestHandle};
pub use state::AppState;
