//! Session store.
//!
//! The one piece of mutable host state shared by otherwise isolated request
//! instances. Records are keyed by an unguessable identifier and bounded by
//! `expires_at`:
//! - lookups of expired records remove them (lazy expiry)
//! - [`SessionStore::sweep_expired`] removes everything expired (active expiry)
//! - [`SessionStore::destroy`] removes unconditionally
//!
//! Capabilities reach the store through [`SessionCapability`], which decides
//! once, at construction, whether dedicated per-session value storage is
//! available or whether value operations fall back to the claims map.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default session lifetime.
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Bytes of randomness in a session identifier.
const SESSION_ID_BYTES: usize = 32;

/// Source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    pub role: String,
    #[serde(default)]
    pub claims: Map<String, Value>,
    /// Scalar key/value storage, separate from `claims`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub values: HashMap<String, String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl SessionRecord {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Data supplied when creating a session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub claims: Map<String, Value>,
}

/// Partial update merged into an existing record.
///
/// `created_at` and `expires_at` are never touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub user_id: Option<String>,
    pub role: Option<String>,
    /// Claims merged key by key.
    pub claims: Map<String, Value>,
    /// Claims removed after the merge.
    pub remove_claims: Vec<String>,
}

impl SessionUpdate {
    fn apply(self, record: &mut SessionRecord) {
        if let Some(user_id) = self.user_id {
            record.user_id = user_id;
        }
        if let Some(role) = self.role {
            record.role = role;
        }
        record.claims.extend(self.claims);
        for key in &self.remove_claims {
            record.claims.remove(key);
        }
    }
}

/// Non-sensitive view of a session for the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub user_id: String,
    pub role: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// The operations every session backend provides.
pub trait SessionBackend: Send + Sync {
    /// Store a new session and return its identifier.
    fn create(&self, data: NewSession, ttl_secs: Option<u64>) -> String;

    /// Fetch a live session. Expired records are removed and reported absent.
    fn get(&self, id: &str) -> Option<SessionRecord>;

    /// Remove a session, returning whether anything was removed.
    fn destroy(&self, id: &str) -> bool;

    /// Merge `update` into a live session.
    fn update(&self, id: &str, update: SessionUpdate) -> bool;

    /// Reset the expiry of a live session to `now + ttl`.
    fn extend(&self, id: &str, ttl_secs: u64) -> bool;
}

/// Dedicated per-session scalar storage.
pub trait SessionValues: Send + Sync {
    fn store_value(&self, id: &str, key: &str, value: String) -> bool;
    fn get_value(&self, id: &str, key: &str) -> Option<String>;
    fn delete_value(&self, id: &str, key: &str) -> bool;
    fn has_value(&self, id: &str, key: &str) -> bool;
}

/// In-memory TTL session store.
#[derive(Debug)]
pub struct SessionStore {
    records: DashMap<String, SessionRecord>,
    clock: Arc<dyn Clock>,
    default_ttl_secs: u64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_SECS)
    }
}

impl SessionStore {
    pub fn new(default_ttl_secs: u64) -> Self {
        Self::with_clock(default_ttl_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(default_ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            default_ttl_secs,
        }
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    fn expiry(&self, now_ms: i64, ttl_secs: u64) -> i64 {
        let ttl_ms = ttl_secs.max(1).saturating_mul(1000);
        now_ms.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX))
    }

    /// Store a new session and return its identifier.
    ///
    /// `ttl_secs` defaults to the store's TTL and is clamped to at least one
    /// second.
    pub fn create(&self, data: NewSession, ttl_secs: Option<u64>) -> String {
        let now = self.clock.now_ms();
        let record = SessionRecord {
            user_id: data.user_id,
            role: data.role,
            claims: data.claims,
            values: HashMap::new(),
            created_at: now,
            expires_at: self.expiry(now, ttl_secs.unwrap_or(self.default_ttl_secs)),
        };

        loop {
            let id = generate_session_id();
            if let Entry::Vacant(slot) = self.records.entry(id.clone()) {
                slot.insert(record);
                return id;
            }
        }
    }

    /// Fetch a live session, removing it if it has expired.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        let now = self.clock.now_ms();
        if self
            .records
            .remove_if(id, |_, record| record.is_expired(now))
            .is_some()
        {
            return None;
        }

        self.records.get(id).map(|record| record.clone())
    }

    pub fn destroy(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    /// Apply `f` to a live record. Expired records are removed instead.
    fn with_live<R>(&self, id: &str, f: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        let now = self.clock.now_ms();
        {
            let mut record = self.records.get_mut(id)?;
            if !record.is_expired(now) {
                return Some(f(&mut record));
            }
        }

        self.records.remove_if(id, |_, record| record.is_expired(now));
        None
    }

    pub fn update(&self, id: &str, update: SessionUpdate) -> bool {
        self.with_live(id, |record| update.apply(record)).is_some()
    }

    pub fn extend(&self, id: &str, ttl_secs: u64) -> bool {
        let now = self.clock.now_ms();
        let expires_at = self.expiry(now, ttl_secs);
        self.with_live(id, |record| record.expires_at = expires_at)
            .is_some()
    }

    /// Remove every expired record and return how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    /// Number of stored records, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Summaries of live sessions.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let now = self.clock.now_ms();
        self.records
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| SessionSummary {
                user_id: entry.user_id.clone(),
                role: entry.role.clone(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            })
            .collect()
    }
}

impl SessionBackend for SessionStore {
    fn create(&self, data: NewSession, ttl_secs: Option<u64>) -> String {
        SessionStore::create(self, data, ttl_secs)
    }

    fn get(&self, id: &str) -> Option<SessionRecord> {
        SessionStore::get(self, id)
    }

    fn destroy(&self, id: &str) -> bool {
        SessionStore::destroy(self, id)
    }

    fn update(&self, id: &str, update: SessionUpdate) -> bool {
        SessionStore::update(self, id, update)
    }

    fn extend(&self, id: &str, ttl_secs: u64) -> bool {
        SessionStore::extend(self, id, ttl_secs)
    }
}

impl SessionValues for SessionStore {
    fn store_value(&self, id: &str, key: &str, value: String) -> bool {
        self.with_live(id, |record| {
            record.values.insert(key.to_string(), value);
        })
        .is_some()
    }

    fn get_value(&self, id: &str, key: &str) -> Option<String> {
        self.with_live(id, |record| record.values.get(key).cloned())
            .flatten()
    }

    fn delete_value(&self, id: &str, key: &str) -> bool {
        self.with_live(id, |record| record.values.remove(key).is_some())
            .unwrap_or(false)
    }

    fn has_value(&self, id: &str, key: &str) -> bool {
        self.with_live(id, |record| record.values.contains_key(key))
            .unwrap_or(false)
    }
}

/// Session access as seen by capability functions.
#[derive(Clone)]
pub struct SessionCapability {
    backend: Arc<dyn SessionBackend>,
    values: Option<Arc<dyn SessionValues>>,
}

impl SessionCapability {
    /// A backend without dedicated value storage; values live in claims.
    pub fn basic(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            values: None,
        }
    }

    /// A backend that also provides dedicated value storage.
    pub fn extended<B>(backend: Arc<B>) -> Self
    where
        B: SessionBackend + SessionValues + 'static,
    {
        Self {
            backend: backend.clone(),
            values: Some(backend),
        }
    }

    pub fn is_extended(&self) -> bool {
        self.values.is_some()
    }

    pub fn create(&self, data: NewSession, ttl_secs: Option<u64>) -> String {
        self.backend.create(data, ttl_secs)
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.backend.get(id)
    }

    pub fn destroy(&self, id: &str) -> bool {
        self.backend.destroy(id)
    }

    pub fn update(&self, id: &str, update: SessionUpdate) -> bool {
        self.backend.update(id, update)
    }

    pub fn extend(&self, id: &str, ttl_secs: u64) -> bool {
        self.backend.extend(id, ttl_secs)
    }

    pub fn store_value(&self, id: &str, key: &str, value: String) -> bool {
        match &self.values {
            Some(values) => values.store_value(id, key, value),
            None => {
                let mut claims = Map::new();
                claims.insert(key.to_string(), Value::String(value));
                self.backend.update(
                    id,
                    SessionUpdate {
                        claims,
                        ..Default::default()
                    },
                )
            }
        }
    }

    pub fn get_value(&self, id: &str, key: &str) -> Option<String> {
        match &self.values {
            Some(values) => values.get_value(id, key),
            None => self
                .backend
                .get(id)?
                .claims
                .get(key)
                .map(|value| match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
        }
    }

    pub fn delete_value(&self, id: &str, key: &str) -> bool {
        match &self.values {
            Some(values) => values.delete_value(id, key),
            None => {
                self.has_value(id, key)
                    && self.backend.update(
                        id,
                        SessionUpdate {
                            remove_claims: vec![key.to_string()],
                            ..Default::default()
                        },
                    )
            }
        }
    }

    pub fn has_value(&self, id: &str, key: &str) -> bool {
        match &self.values {
            Some(values) => values.has_value(id, key),
            None => self
                .backend
                .get(id)
                .is_some_and(|record| record.claims.contains_key(key)),
        }
    }
}

impl std::fmt::Debug for SessionCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCapability")
            .field("extended", &self.is_extended())
            .finish_non_exhaustive()
    }
}

/// Generate an opaque, URL-safe session identifier.
fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
