//! Response Assembler.
//!
//! Copies a sealed [`ResponseEnvelope`] onto the axum response. The content
//! type goes through the dedicated `Content-Type` slot, other headers are
//! appended verbatim and every cookie gets its own `Set-Cookie` header.

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum_extra::extract::cookie::{Cookie, SameSite as CookieSameSite};
use cookie::time::Duration;
use tracing::warn;

use guest_runtime_core::{ResponseCookie, ResponseEnvelope, SameSite};

/// Convert a guest cookie into a transport cookie.
pub fn to_cookie(cookie: &ResponseCookie) -> Cookie<'static> {
    let mut builder = Cookie::build((cookie.name.clone(), cookie.value.clone()))
        .path(cookie.path.clone())
        .http_only(cookie.http_only)
        .secure(cookie.secure);

    if let Some(max_age) = cookie.max_age {
        builder = builder.max_age(Duration::seconds(max_age));
    }
    if let Some(same_site) = cookie.same_site {
        builder = builder.same_site(match same_site {
            SameSite::Strict => CookieSameSite::Strict,
            SameSite::Lax => CookieSameSite::Lax,
            SameSite::None => CookieSameSite::None,
        });
    }

    builder.build()
}

/// Build the transport response from a sealed envelope.
///
/// A missing body is sent as an empty body.
pub fn assemble(envelope: &ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(envelope.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(Body::from(envelope.body().unwrap_or_default().to_string()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in envelope.headers() {
        let Ok(value) = HeaderValue::try_from(value.as_str()) else {
            warn!(header = %name, "Dropping header with invalid value");
            continue;
        };

        if name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
            headers.insert(CONTENT_TYPE, value);
            continue;
        }

        match HeaderName::try_from(name.as_str()) {
            Ok(name) => {
                headers.append(name, value);
            }
            Err(_) => warn!(header = %name, "Dropping header with invalid name"),
        }
    }

    // One header per cookie; same-name cookies on different paths all survive.
    for cookie in envelope.cookies() {
        match HeaderValue::from_str(&to_cookie(cookie).to_string()) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(_) => warn!(cookie = %cookie.name, "Dropping cookie with invalid value"),
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_runtime_core::{CookieOptions, ResponseCookie};

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_default_envelope() {
        let mut envelope = ResponseEnvelope::new();
        envelope.finalize();

        let response = assemble(&envelope);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(body(response).await, "");
    }

    #[tokio::test]
    async fn test_headers_and_content_type() {
        let mut envelope = ResponseEnvelope::new();
        envelope.set_status(201).unwrap();
        envelope.set_header("content-TYPE", "text/plain; charset=utf-8").unwrap();
        envelope.set_header("X-Custom", "value").unwrap();
        envelope.set_header("Bad Name", "x").unwrap();
        envelope.set_body("created").unwrap();
        envelope.finalize();

        let response = assemble(&envelope);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(response.headers()["x-custom"], "value");
        assert_eq!(body(response).await, "created");
    }

    #[test]
    fn test_cookies_carry_attributes() {
        let mut envelope = ResponseEnvelope::new();
        envelope
            .add_cookie(ResponseCookie::session("session_id", "abc", 3600, true))
            .unwrap();
        envelope
            .add_cookie(ResponseCookie::with_options(
                "theme",
                "dark",
                CookieOptions {
                    same_site: Some("strict".into()),
                    path: Some("/app".into()),
                    ..Default::default()
                },
            ))
            .unwrap();
        envelope.finalize();

        let response = assemble(&envelope);
        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();

        let session = cookies.iter().find(|c| c.starts_with("session_id=abc")).unwrap();
        assert!(session.contains("HttpOnly"));
        assert!(session.contains("Secure"));
        assert!(session.contains("SameSite=Lax"));
        assert!(session.contains("Max-Age=3600"));
        assert!(session.contains("Path=/"));

        let theme = cookies.iter().find(|c| c.starts_with("theme=dark")).unwrap();
        assert!(theme.contains("SameSite=Strict"));
        assert!(theme.contains("Path=/app"));
        assert!(!theme.contains("HttpOnly"));
    }

    #[test]
    fn test_same_name_cookies_on_different_paths() {
        let mut envelope = ResponseEnvelope::new();
        for path in ["/app", "/admin"] {
            envelope
                .add_cookie(ResponseCookie::with_options(
                    "pref",
                    path.trim_start_matches('/'),
                    CookieOptions {
                        path: Some(path.into()),
                        ..Default::default()
                    },
                ))
                .unwrap();
        }
        envelope.finalize();

        let response = assemble(&envelope);
        let cookies: Vec<&str> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();

        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("pref=app") && cookies[0].contains("Path=/app"));
        assert!(cookies[1].starts_with("pref=admin") && cookies[1].contains("Path=/admin"));
    }

    #[test]
    fn test_expired_cookie() {
        let cookie = to_cookie(&ResponseCookie::expired("session_id"));

        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(Duration::ZERO));
    }

    #[test]
    fn test_redirect() {
        let mut envelope = ResponseEnvelope::new();
        envelope.redirect("/login", 303).unwrap();
        envelope.finalize();

        let response = assemble(&envelope);

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()["location"], "/login");
    }
}
