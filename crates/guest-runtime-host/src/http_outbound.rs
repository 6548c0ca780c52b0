//! Outbound HTTP for guest code.
//!
//! [`HttpOutboundHost`] is the reqwest-backed [`OutboundHttp`] collaborator.
//! It enforces the host allowlist and the private-address block, both on the
//! first request and on every redirect hop. The per-request call budget is
//! enforced by the capability functions against the request's own metrics.
//!
//! Every verb returns a JSON envelope:
//! `{"ok":true,"status":200,"headers":{..},"body":".."}` or
//! `{"ok":false,"error":".."}`.

use std::time::Duration;

use async_trait::async_trait;
use guest_runtime_common::{OutboundHttpConfig, RuntimeError};
use guest_runtime_core::{GuestState, HttpError, HttpMethod, HttpRequest, HttpResponse, OutboundHttp};
use reqwest::Client;
use reqwest::redirect::Policy;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Linker};

use crate::Permissions;
use crate::bridge::{link_error, text_arg, text_result};

const MODULE: &str = "http";

/// Largest response body handed back to a guest.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

/// Outbound HTTP client with permission checks.
pub struct HttpOutboundHost {
    /// Shared, connection pooled.
    client: Client,
    permissions: Permissions,
}

impl HttpOutboundHost {
    /// Build a client for the configured allowlist and timeout.
    pub fn from_config(config: &OutboundHttpConfig) -> Result<Self, RuntimeError> {
        let permissions = Permissions::from_config(config);

        let redirect_permissions = permissions.clone();
        let redirects = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.stop()
            } else if redirect_permissions.is_http_allowed(attempt.url().as_str()) {
                attempt.follow()
            } else {
                warn!(uri = %attempt.url(), "Redirect blocked: target not permitted");
                attempt.stop()
            }
        });

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .redirect(redirects)
            .user_agent(concat!("guest-runtime/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, permissions })
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }
}

#[async_trait]
impl OutboundHttp for HttpOutboundHost {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        if !self.permissions.is_http_allowed(&request.uri) {
            warn!(uri = %request.uri, "HTTP request blocked: host not permitted");
            return Err(HttpError::PermissionDenied);
        }

        debug!(method = ?request.method, uri = %request.uri, "Executing HTTP request");

        let mut builder = self.client.request(reqwest_method(request.method), &request.uri);
        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else if e.is_connect() {
                HttpError::ConnectionFailed
            } else {
                HttpError::Other
            }
        })?;

        let status = response.status().as_u16();
        if response
            .content_length()
            .is_some_and(|len| len > MAX_BODY_BYTES as u64)
        {
            return Err(HttpError::BodyTooLarge);
        }

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else {
                HttpError::Other
            }
        })?;
        if body.len() > MAX_BODY_BYTES {
            return Err(HttpError::BodyTooLarge);
        }

        info!(uri = %request.uri, status, body_size = body.len(), "HTTP request completed");

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    fn max_requests(&self) -> u32 {
        self.permissions.max_http_requests
    }
}

/// Render a fetch result as the guest-facing envelope.
pub fn envelope(result: Result<HttpResponse, HttpError>) -> String {
    match result {
        Ok(response) => {
            let mut headers = Map::new();
            for (name, value) in response.headers {
                match headers.get_mut(&name) {
                    Some(Value::String(existing)) => {
                        existing.push_str(", ");
                        existing.push_str(&value);
                    }
                    _ => {
                        headers.insert(name, Value::String(value));
                    }
                }
            }
            json!({
                "ok": true,
                "status": response.status,
                "headers": headers,
                "body": String::from_utf8_lossy(&response.body),
            })
            .to_string()
        }
        Err(e) => json!({"ok": false, "error": e.to_string()}).to_string(),
    }
}

/// Count one outbound call against the request's budget.
pub fn reserve_call(state: &mut GuestState, max_requests: u32) -> bool {
    if state.metrics.http_requests >= max_requests {
        warn!(
            request_id = %state.request_id,
            count = state.metrics.http_requests,
            max = max_requests,
            "HTTP rate limit exceeded"
        );
        return false;
    }
    state.metrics.http_requests += 1;
    true
}

fn content_type(body: &str) -> &'static str {
    if serde_json::from_str::<Value>(body).is_ok_and(|v| v.is_object() || v.is_array()) {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    }
}

async fn call(
    caller: &mut Caller<'_, GuestState>,
    method: HttpMethod,
    uri: String,
    body: Option<String>,
) -> String {
    let Some(client) = caller.data().services().outbound().cloned() else {
        debug!(uri = %uri, "Outbound HTTP is not enabled");
        return envelope(Err(HttpError::PermissionDenied));
    };
    if !reserve_call(caller.data_mut(), client.max_requests()) {
        return envelope(Err(HttpError::RateLimited));
    }

    let mut request = HttpRequest::new(method, uri);
    if let Some(body) = body {
        request
            .headers
            .push(("content-type".into(), content_type(&body).into()));
        request = request.with_body(body);
    }

    envelope(client.fetch(request).await)
}

/// Register the outbound verbs on the `http` module.
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    for (name, method) in [("http_get", HttpMethod::Get), ("http_delete", HttpMethod::Delete)] {
        linker
            .func_wrap_async(
                MODULE,
                name,
                move |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                    Box::new(async move {
                        let uri = text_arg(&mut caller, name, ptr, len);
                        let result = call(&mut caller, method, uri, None).await;
                        text_result(&mut caller, name, &result).await
                    })
                },
            )
            .map_err(|e| link_error(MODULE, name, &e))?;
    }

    for (name, method) in [
        ("http_post", HttpMethod::Post),
        ("http_put", HttpMethod::Put),
        ("http_patch", HttpMethod::Patch),
    ] {
        linker
            .func_wrap_async(
                MODULE,
                name,
                move |mut caller: Caller<'_, GuestState>,
                      (url_ptr, url_len, body_ptr, body_len): (i32, i32, i32, i32)| {
                    Box::new(async move {
                        let uri = text_arg(&mut caller, name, url_ptr, url_len);
                        let body = text_arg(&mut caller, name, body_ptr, body_len);
                        let result = call(&mut caller, method, uri, Some(body)).await;
                        text_result(&mut caller, name, &result).await
                    })
                },
            )
            .map_err(|e| link_error(MODULE, name, &e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_runtime_core::{HostServices, RequestContext};

    fn host(hosts: &[&str], max_requests: u32) -> HttpOutboundHost {
        HttpOutboundHost::from_config(&OutboundHttpConfig {
            allowed_hosts: hosts.iter().map(ToString::to_string).collect(),
            max_requests,
            timeout_ms: 1_000,
        })
        .unwrap()
    }

    #[test]
    fn test_http_method_conversion() {
        assert_eq!(reqwest_method(HttpMethod::Get), reqwest::Method::GET);
        assert_eq!(reqwest_method(HttpMethod::Post), reqwest::Method::POST);
        assert_eq!(reqwest_method(HttpMethod::Patch), reqwest::Method::PATCH);
        assert_eq!(reqwest_method(HttpMethod::Delete), reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let host = host(&["allowed.com"], 10);

        let result = host
            .fetch(HttpRequest::new(HttpMethod::Get, "https://blocked.com/path"))
            .await;

        assert!(matches!(result, Err(HttpError::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_ssrf_blocked() {
        let host = host(&["*"], 10);

        for uri in ["http://localhost:8080/", "http://192.168.1.1/", "http://169.254.169.254/"] {
            let result = host.fetch(HttpRequest::new(HttpMethod::Get, uri)).await;
            assert!(matches!(result, Err(HttpError::PermissionDenied)), "{uri}");
        }
    }

    #[test]
    fn test_reserve_call_enforces_budget() {
        let mut state = GuestState::for_request("rl", RequestContext::default(), HostServices::default());

        assert!(reserve_call(&mut state, 2));
        assert!(reserve_call(&mut state, 2));
        assert!(!reserve_call(&mut state, 2));
        assert_eq!(state.metrics.http_requests, 2);

        let mut fresh = GuestState::for_request("rl2", RequestContext::default(), HostServices::default());
        assert!(!reserve_call(&mut fresh, 0));
    }

    #[test]
    fn test_envelope_success_merges_headers() {
        let json: Value = serde_json::from_str(&envelope(Ok(HttpResponse {
            status: 201,
            headers: vec![
                ("x-a".into(), "1".into()),
                ("x-a".into(), "2".into()),
                ("content-type".into(), "text/plain".into()),
            ],
            body: b"created".to_vec(),
        })))
        .unwrap();

        assert_eq!(json["ok"], true);
        assert_eq!(json["status"], 201);
        assert_eq!(json["headers"]["x-a"], "1, 2");
        assert_eq!(json["body"], "created");
    }

    #[test]
    fn test_envelope_error() {
        let json: Value = serde_json::from_str(&envelope(Err(HttpError::RateLimited))).unwrap();
        assert_eq!(json, json!({"ok": false, "error": "rate limited"}));
    }

    #[test]
    fn test_content_type_detection() {
        assert_eq!(content_type(r#"{"a":1}"#), "application/json");
        assert_eq!(content_type("[1]"), "application/json");
        assert_eq!(content_type("plain words"), "text/plain; charset=utf-8");
        assert_eq!(content_type("42"), "text/plain; charset=utf-8");
    }
}
