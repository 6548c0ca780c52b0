//! Capability functions for guest-runtime guests.
//!
//! Each module registers one slice of the import catalog on a
//! `Linker<GuestState>`; [`linker::register_all`] wires all of them.
//!
//! # Calling convention
//!
//! Strings enter as `(ptr, len)` pairs into guest memory and leave as a
//! pointer to a length-prefixed buffer allocated by the guest's `alloc`
//! export. Returned buffers are tracked in the active memory scope.
//!
//! # Security model
//!
//! 1. **Sandboxing**: file capabilities only see paths below the configured
//!    sandbox root.
//! 2. **Outbound allowlist**: HTTP calls reach allowed hosts only, never
//!    private or metadata addresses, within a per-request budget.
//! 3. **Safe defaults**: a failing capability returns `0`, `-1` or an empty
//!    string instead of trapping. Only misuse of route registration traps.

mod bridge;

pub mod auth;
pub mod crypto;
pub mod database;
pub mod files;
pub mod http_api;
pub mod http_outbound;
pub mod linker;
pub mod logging;
pub mod memory_runtime;
pub mod permissions;
pub mod system;
pub mod values;

pub use database::SqliteDriver;
pub use files::Sandbox;
pub use http_outbound::HttpOutboundHost;
pub use linker::{create_instance_runner, host_services, register_all};
pub use logging::LoggingHost;
pub use permissions::Permissions;
