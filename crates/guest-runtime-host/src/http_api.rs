//! Routing, response and request capabilities in the `http` module.
//!
//! Route registration is only open while the guest's startup code runs; a
//! registration from a request instance traps, failing the request loudly.
//! Response setters write to the instance's envelope and are ignored once it
//! is sealed. Request readers return an empty string for absent values.

use guest_runtime_common::{RouteError, RuntimeError};
use guest_runtime_core::context::{CookieOptions, ResponseCookie, ResponseEnvelope, ResponseSealed};
use guest_runtime_core::{GuestState, RequestContext, RouteSpec};
use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use crate::bridge::{link_error, text_arg, text_result};

const MODULE: &str = "http";

/// Default status for `_http_redirect` when the guest passes `0`.
pub const DEFAULT_REDIRECT_STATUS: u16 = 302;

/// Register a route from the guest, trapping when registration is closed.
fn register_route(
    caller: &mut Caller<'_, GuestState>,
    spec: RouteSpec,
) -> wasmtime::Result<i32> {
    debug!(
        method = %spec.method,
        pattern = %spec.pattern,
        handler_index = spec.handler_index,
        protected = spec.is_protected,
        "Registering route"
    );
    caller.data_mut().register_route(spec)?;
    Ok(1)
}

/// Convert the guest's handler index, rejecting negative values.
pub fn parse_handler_index(method: &str, pattern: &str, index: i32) -> Result<u32, RouteError> {
    u32::try_from(index).map_err(|_| RouteError::InvalidHandler {
        method: method.to_string(),
        pattern: pattern.to_string(),
        index,
    })
}

/// Apply a change to the response, logging writes after the response is sealed.
fn respond(
    caller: &mut Caller<'_, GuestState>,
    capability: &str,
    change: impl FnOnce(&mut ResponseEnvelope) -> Result<(), ResponseSealed>,
) {
    let state = caller.data_mut();
    if let Err(e) = change(&mut state.response) {
        warn!(request_id = %state.request_id, capability, error = %e, "Write ignored");
    }
}

/// Parse the guest's cookie options; malformed JSON falls back to defaults.
pub fn parse_cookie_options(json: &str) -> CookieOptions {
    if json.trim().is_empty() {
        return CookieOptions::default();
    }

    serde_json::from_str(json).unwrap_or_else(|e| {
        warn!(error = %e, "Invalid cookie options");
        CookieOptions::default()
    })
}

/// Convert a guest status code, rejecting values outside 100..=599.
pub fn status_code(code: i32) -> Option<u16> {
    u16::try_from(code)
        .ok()
        .filter(|code| (100..=599).contains(code))
}

/// Register the routing and response-shaping capabilities.
pub fn register_response(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            MODULE,
            "_http_route",
            |mut caller: Caller<'_, GuestState>,
             method_ptr: i32,
             method_len: i32,
             pattern_ptr: i32,
             pattern_len: i32,
             handler_index: i32| {
                let method = text_arg(&mut caller, "_http_route", method_ptr, method_len);
                let pattern = text_arg(&mut caller, "_http_route", pattern_ptr, pattern_len);
                let index = parse_handler_index(&method, &pattern, handler_index)?;
                register_route(&mut caller, RouteSpec::new(method, pattern, index))
            },
        )
        .map_err(|e| link_error(MODULE, "_http_route", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_http_route_protected",
            |mut caller: Caller<'_, GuestState>,
             method_ptr: i32,
             method_len: i32,
             pattern_ptr: i32,
             pattern_len: i32,
             handler_index: i32,
             role_ptr: i32,
             role_len: i32| {
                let name = "_http_route_protected";
                let method = text_arg(&mut caller, name, method_ptr, method_len);
                let pattern = text_arg(&mut caller, name, pattern_ptr, pattern_len);
                let role = text_arg(&mut caller, name, role_ptr, role_len);
                let index = parse_handler_index(&method, &pattern, handler_index)?;
                let spec = RouteSpec::new(method, pattern, index).protected(Some(role));
                register_route(&mut caller, spec)
            },
        )
        .map_err(|e| link_error(MODULE, "_http_route_protected", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_http_set_status",
            |mut caller: Caller<'_, GuestState>, code: i32| {
                let Some(status) = status_code(code) else {
                    warn!(code, "Invalid status code ignored");
                    return;
                };
                respond(&mut caller, "_http_set_status", |r| r.set_status(status));
            },
        )
        .map_err(|e| link_error(MODULE, "_http_set_status", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_http_set_header",
            |mut caller: Caller<'_, GuestState>,
             name_ptr: i32,
             name_len: i32,
             value_ptr: i32,
             value_len: i32| {
                let name = text_arg(&mut caller, "_http_set_header", name_ptr, name_len);
                let value = text_arg(&mut caller, "_http_set_header", value_ptr, value_len);
                if name.is_empty() {
                    return;
                }
                respond(&mut caller, "_http_set_header", |r| r.set_header(&name, value));
            },
        )
        .map_err(|e| link_error(MODULE, "_http_set_header", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_http_set_body",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
                let body = text_arg(&mut caller, "_http_set_body", ptr, len);
                respond(&mut caller, "_http_set_body", |r| r.set_body(body));
            },
        )
        .map_err(|e| link_error(MODULE, "_http_set_body", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_http_set_cookie",
            |mut caller: Caller<'_, GuestState>,
             name_ptr: i32,
             name_len: i32,
             value_ptr: i32,
             value_len: i32,
             options_ptr: i32,
             options_len: i32| {
                let name = text_arg(&mut caller, "_http_set_cookie", name_ptr, name_len);
                let value = text_arg(&mut caller, "_http_set_cookie", value_ptr, value_len);
                let options = text_arg(&mut caller, "_http_set_cookie", options_ptr, options_len);
                if name.is_empty() {
                    return;
                }
                let cookie = ResponseCookie::with_options(name, value, parse_cookie_options(&options));
                respond(&mut caller, "_http_set_cookie", |r| r.add_cookie(cookie));
            },
        )
        .map_err(|e| link_error(MODULE, "_http_set_cookie", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_http_redirect",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32, code: i32| {
                let location = text_arg(&mut caller, "_http_redirect", ptr, len);
                let status = if code == 0 {
                    DEFAULT_REDIRECT_STATUS
                } else {
                    match status_code(code) {
                        Some(status) if (300..400).contains(&status) => status,
                        _ => {
                            warn!(code, "Invalid redirect status, using 302");
                            DEFAULT_REDIRECT_STATUS
                        }
                    }
                };
                respond(&mut caller, "_http_redirect", |r| r.redirect(&location, status));
            },
        )
        .map_err(|e| link_error(MODULE, "_http_redirect", &e))?;

    Ok(())
}

/// A request reader taking no arguments.
type Reader = fn(&RequestContext) -> String;

/// A request reader keyed by a name argument.
type KeyedReader = fn(&RequestContext, &str) -> Option<String>;

/// Register the request-reader capabilities.
pub fn register_request(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    let readers: [(&'static str, Reader); 5] = [
        ("_req_method", |r| r.method.clone()),
        ("_req_path", |r| r.path.clone()),
        ("_req_body", |r| r.body.clone()),
        ("_req_params_json", RequestContext::params_json),
        ("_req_query_json", RequestContext::query_json),
    ];
    for (name, read) in readers {
        linker
            .func_wrap_async(
                MODULE,
                name,
                move |mut caller: Caller<'_, GuestState>, (): ()| {
                    Box::new(async move {
                        let text = read(&caller.data().request);
                        text_result(&mut caller, name, &text).await
                    })
                },
            )
            .map_err(|e| link_error(MODULE, name, &e))?;
    }

    let keyed: [(&'static str, KeyedReader); 4] = [
        ("_req_param", |r, k| r.param(k).map(str::to_string)),
        ("_req_query", |r, k| r.query_param(k).map(str::to_string)),
        ("_req_header", |r, k| r.header(k).map(str::to_string)),
        ("_req_cookie", |r, k| r.cookie(k).map(str::to_string)),
    ];
    for (name, read) in keyed {
        linker
            .func_wrap_async(
                MODULE,
                name,
                move |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                    Box::new(async move {
                        let key = text_arg(&mut caller, name, ptr, len);
                        let text = read(&caller.data().request, &key).unwrap_or_default();
                        text_result(&mut caller, name, &text).await
                    })
                },
            )
            .map_err(|e| link_error(MODULE, name, &e))?;
    }

    Ok(())
}
