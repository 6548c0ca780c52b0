//! Host-side services shared by every request.
//!
//! Capability functions reach shared state through [`HostServices`], which is
//! injected by reference into each request's store: the session store, the
//! optional database driver, the optional outbound HTTP client and the
//! host-global settings. The database and HTTP collaborators are traits so
//! the core never depends on a concrete driver.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use serde_json::{Map, Value};
use thiserror::Error;

use guest_runtime_common::{DatabaseError, HostConfig};

use crate::session::{SessionCapability, SessionStore};

/// A row as returned to the guest: column name to JSON value.
pub type Row = Map<String, Value>;

/// Database driver collaborator.
///
/// Engine selection happens outside the core, by connection-string scheme.
/// Statements run inside transaction `tx` when one is given and in
/// autocommit mode otherwise. Open transactions never see each other's
/// statements, nor autocommit statements issued by other requests.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Run a statement that returns rows.
    async fn query(
        &self,
        tx: Option<&str>,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Row>, DatabaseError>;

    /// Run a statement and return the number of affected rows.
    async fn execute(
        &self,
        tx: Option<&str>,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<u64, DatabaseError>;

    /// Open a transaction and return its identifier.
    async fn begin_transaction(&self) -> Result<String, DatabaseError>;

    async fn commit(&self, tx_id: &str) -> Result<(), DatabaseError>;

    async fn rollback(&self, tx_id: &str) -> Result<(), DatabaseError>;

    async fn close(&self) -> Result<(), DatabaseError>;

    /// Short engine name for logs.
    fn engine(&self) -> &'static str;
}

/// HTTP request issued by guest code.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: None,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// HTTP response handed back to guest code.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

/// Outbound HTTP failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("request timed out")]
    Timeout,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("response body too large")]
    BodyTooLarge,
    #[error("rate limited")]
    RateLimited,
    #[error("request failed")]
    Other,
}

/// Outbound HTTP collaborator.
#[async_trait]
pub trait OutboundHttp: Send + Sync {
    /// Perform a request. Permission checks happen inside.
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;

    /// Maximum number of calls a single guest request may make.
    fn max_requests(&self) -> u32;
}

/// Host-global settings read by capability functions.
#[derive(Clone)]
pub struct HostSettings {
    /// Root of the sandboxed file capability; `None` disables it.
    pub sandbox_root: Option<PathBuf>,
    /// Key for signing and verifying guest tokens.
    pub token_secret: Vec<u8>,
    pub session_cookie: String,
    pub session_ttl_secs: u64,
    pub secure_cookie: bool,
    pub verbose: bool,
}

impl HostSettings {
    /// Build settings from configuration.
    ///
    /// A random token secret is generated when none is configured, so tokens
    /// do not survive a restart.
    pub fn from_config(config: &HostConfig) -> Self {
        let token_secret = match &config.token_secret {
            Some(secret) if !secret.is_empty() => secret.as_bytes().to_vec(),
            _ => {
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };

        Self {
            sandbox_root: config.sandbox_root.as_ref().map(PathBuf::from),
            token_secret,
            session_cookie: config.session.cookie_name.clone(),
            session_ttl_secs: config.session.ttl_secs,
            secure_cookie: config.session.secure_cookie,
            verbose: config.verbose,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self::from_config(&HostConfig::default())
    }
}

impl fmt::Debug for HostSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSettings")
            .field("sandbox_root", &self.sandbox_root)
            .field("session_cookie", &self.session_cookie)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("secure_cookie", &self.secure_cookie)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

/// Shared services injected into every request.
#[derive(Clone)]
pub struct HostServices {
    store: Arc<SessionStore>,
    sessions: SessionCapability,
    database: Option<Arc<dyn DatabaseDriver>>,
    outbound: Option<Arc<dyn OutboundHttp>>,
    settings: Arc<HostSettings>,
}

impl HostServices {
    pub fn new(settings: HostSettings, store: Arc<SessionStore>) -> Self {
        Self {
            sessions: SessionCapability::extended(store.clone()),
            store,
            database: None,
            outbound: None,
            settings: Arc::new(settings),
        }
    }

    #[must_use]
    pub fn with_database(mut self, driver: Arc<dyn DatabaseDriver>) -> Self {
        self.database = Some(driver);
        self
    }

    #[must_use]
    pub fn with_outbound(mut self, client: Arc<dyn OutboundHttp>) -> Self {
        self.outbound = Some(client);
        self
    }

    /// Replace the session capability, e.g. with a backend lacking value storage.
    #[must_use]
    pub fn with_session_capability(mut self, sessions: SessionCapability) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn sessions(&self) -> &SessionCapability {
        &self.sessions
    }

    /// The concrete store, for sweeping and admin views.
    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The database driver.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Unavailable`] when none is configured.
    pub fn database(&self) -> Result<&Arc<dyn DatabaseDriver>, DatabaseError> {
        self.database.as_ref().ok_or(DatabaseError::Unavailable)
    }

    pub fn outbound(&self) -> Option<&Arc<dyn OutboundHttp>> {
        self.outbound.as_ref()
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::new(HostSettings::default(), Arc::new(SessionStore::default()))
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("sessions", &self.store.len())
            .field("database", &self.database.as_ref().map(|db| db.engine()))
            .field("outbound", &self.outbound.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}
