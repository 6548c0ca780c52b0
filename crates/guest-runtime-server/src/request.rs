//! Inbound HTTP request conversion.
//!
//! Turns the axum request into the [`RequestContext`] the guest reads.

use axum::http::request::Parts;
use axum_extra::extract::cookie::CookieJar;
use bytes::Bytes;

use guest_runtime_core::RequestContext;

/// Build a request context from request parts and the collected body.
///
/// Header names are lower-cased and repeated headers are joined with `", "`.
/// A body that is not valid UTF-8 is decoded lossily.
pub fn from_parts(parts: &Parts, body: &Bytes) -> RequestContext {
    let target = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let mut context = RequestContext::new(parts.method.as_str(), target);

    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        context
            .headers
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let jar = CookieJar::from_headers(&parts.headers);
    context.cookies = jar
        .iter()
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect();

    context.body = String::from_utf8_lossy(body).into_owned();
    context
}
