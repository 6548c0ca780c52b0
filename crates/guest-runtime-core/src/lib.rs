//! Core runtime for guest-runtime.
//!
//! This crate turns a compiled WebAssembly guest into an HTTP service:
//! - [`WasmEngine`]: Configured Wasmtime engine with pooling allocator
//! - [`CompiledModule`]: The validated guest binary and its ABI
//! - [`memory`]: Marshalling of text and numbers across linear memory
//! - [`MemoryScopes`]: Reference-counted tracking of guest allocations
//! - [`RouteTable`]: Routes registered once at startup, then frozen
//! - [`SessionStore`]: TTL session records shared by all requests
//! - [`InstanceRunner`]: Instantiation and handler invocation
//! - [`RequestLifecycle`]: The per-request state machine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared across all requests, thread-safe)              │
//! │  - Pooling Allocator, fuel, epochs                      │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          CompiledModule  +  RouteTable (frozen)         │
//! │  (Loaded once, shared read-only)                        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │             Store<GuestState> + Instance                │
//! │  (Per-request, isolated, discarded afterwards)          │
//! │  - RequestContext / ResponseEnvelope                    │
//! │  - Memory scopes, logs and metrics                      │
//! │  - HostServices by reference (sessions, database)       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod engine;
pub mod instance;
pub mod lifecycle;
pub mod memory;
pub mod module;
pub mod router;
pub mod scope;
pub mod services;
pub mod session;
pub mod store;

pub use context::{
    AuthContext, CookieOptions, RequestContext, ResponseCookie, ResponseEnvelope,
    ResponseSealed, SameSite,
};
pub use engine::WasmEngine;
pub use instance::InstanceRunner;
pub use lifecycle::{LifecycleState, RequestLifecycle, RequestOutcome};
pub use memory::GuestMemory;
pub use module::{CompiledModule, GuestAbi};
pub use router::{RouteHandler, RouteInfo, RouteMatch, RouteSpec, RouteTable, RouteTableBuilder};
pub use scope::MemoryScopes;
pub use services::{
    DatabaseDriver, HostServices, HostSettings, HttpError, HttpMethod, HttpRequest,
    HttpResponse, OutboundHttp, Row,
};
pub use session::{
    Clock, ManualClock, NewSession, SessionBackend, SessionCapability, SessionRecord,
    SessionStore, SessionSummary, SessionUpdate, SessionValues, SystemClock,
};
pub use store::{ExecutionMetrics, GuestState, LogEntry, LogLevel};
