//! Per-request context and response envelope.
//!
//! A [`RequestContext`] is built once per inbound request and read by the
//! request-reader capabilities. A [`ResponseEnvelope`] is mutated by the
//! response-shaping capabilities while the handler runs, then sealed and read
//! exactly once when the transport response is assembled.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default content type of every response.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Authentication state derived from the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub user_id: String,
    pub role: String,
    pub session_id: String,
}

/// The inbound request as seen by the guest.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    /// Raw path, still percent-encoded.
    pub path: String,
    /// Percent-decoded route parameters, filled in after routing.
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Headers keyed by lower-cased name.
    pub headers: HashMap<String, String>,
    pub body: String,
    pub cookies: HashMap<String, String>,
    /// Session identifier taken from the session cookie.
    pub session_id: Option<String>,
    pub auth: Option<AuthContext>,
}

impl RequestContext {
    /// Create a context from a method and a raw request target (`/path?query`).
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        Self {
            method: method.into().to_ascii_uppercase(),
            path: if path.is_empty() { "/" } else { path }.to_string(),
            query: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn query_json(&self) -> String {
        serde_json::to_string(&self.query).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Same-site policy of a response cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "lax" => Some(Self::Lax),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Cookie options as the guest passes them (JSON).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieOptions {
    pub max_age: Option<i64>,
    pub http_only: Option<bool>,
    pub secure: Option<bool>,
    pub same_site: Option<String>,
    pub path: Option<String>,
}

/// A cookie to set on the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCookie {
    pub name: String,
    pub value: String,
    /// Lifetime in seconds; `Some(0)` expires the cookie.
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
    pub path: String,
}

impl ResponseCookie {
    /// A cookie with no attributes beyond `Path=/`.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            max_age: None,
            http_only: false,
            secure: false,
            same_site: None,
            path: "/".to_string(),
        }
    }

    /// Build a cookie from guest-supplied options.
    pub fn with_options(
        name: impl Into<String>,
        value: impl Into<String>,
        options: CookieOptions,
    ) -> Self {
        let mut cookie = Self::new(name, value);
        cookie.max_age = options.max_age;
        cookie.http_only = options.http_only.unwrap_or(false);
        cookie.secure = options.secure.unwrap_or(false);
        cookie.same_site = options.same_site.as_deref().and_then(SameSite::parse);
        if let Some(path) = options.path.filter(|p| !p.is_empty()) {
            cookie.path = path;
        }
        cookie
    }

    /// The session cookie issued on session creation.
    pub fn session(name: &str, id: &str, ttl_secs: u64, secure: bool) -> Self {
        Self {
            max_age: Some(i64::try_from(ttl_secs.max(1)).unwrap_or(i64::MAX)),
            http_only: true,
            secure,
            same_site: Some(SameSite::Lax),
            ..Self::new(name, id)
        }
    }

    /// A cookie that removes `name` from the client.
    pub fn expired(name: &str) -> Self {
        Self {
            max_age: Some(0),
            http_only: true,
            same_site: Some(SameSite::Lax),
            ..Self::new(name, "")
        }
    }
}

/// Returned when a capability writes to a response that has already been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("response is sealed")]
pub struct ResponseSealed;

/// The response accumulated while a handler runs.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    status: u16,
    headers: Vec<(String, String)>,
    body: Option<String>,
    cookies: Vec<ResponseCookie>,
    sealed: bool,
}

impl Default for ResponseEnvelope {
    fn default() -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), DEFAULT_CONTENT_TYPE.to_string())],
            body: None,
            cookies: Vec::new(),
            sealed: false,
        }
    }
}

impl ResponseEnvelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sealed `{"ok":false,"err":{"code","message"}}` response.
    pub fn error(status: u16, code: &str, message: &str) -> Self {
        let body = serde_json::json!({
            "ok": false,
            "err": { "code": code, "message": message },
        });

        Self {
            status,
            body: Some(body.to_string()),
            sealed: true,
            ..Self::default()
        }
    }

    fn writable(&self) -> Result<(), ResponseSealed> {
        if self.sealed {
            Err(ResponseSealed)
        } else {
            Ok(())
        }
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), ResponseSealed> {
        self.writable()?;
        self.status = status;
        Ok(())
    }

    /// Set a header, replacing any existing header with the same name.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ResponseSealed> {
        self.writable()?;
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        Ok(())
    }

    pub fn set_body(&mut self, body: impl Into<String>) -> Result<(), ResponseSealed> {
        self.writable()?;
        self.body = Some(body.into());
        Ok(())
    }

    pub fn add_cookie(&mut self, cookie: ResponseCookie) -> Result<(), ResponseSealed> {
        self.writable()?;
        self.cookies.push(cookie);
        Ok(())
    }

    pub fn redirect(&mut self, location: &str, status: u16) -> Result<(), ResponseSealed> {
        self.set_status(status)?;
        self.set_header("Location", location)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn cookies(&self) -> &[ResponseCookie] {
        &self.cookies
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Apply the HTML content-type correction and seal the envelope.
    ///
    /// A body starting with an HTML document marker is served as
    /// `text/html` when the content type is still the default.
    pub fn finalize(&mut self) {
        if self.sealed {
            return;
        }

        let still_default = self
            .content_type()
            .is_some_and(|ct| ct.eq_ignore_ascii_case(DEFAULT_CONTENT_TYPE));

        if still_default && self.body.as_deref().is_some_and(looks_like_html) {
            // Never fails: the envelope is not sealed yet.
            let _ = self.set_header("Content-Type", HTML_CONTENT_TYPE);
        }

        self.sealed = true;
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start().as_bytes();
    [b"<!doctype html".as_slice(), b"<html"]
        .iter()
        .any(|marker| head.get(..marker.len()).is_some_and(|h| h.eq_ignore_ascii_case(marker)))
}
