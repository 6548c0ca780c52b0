//! Session and authentication capabilities (`session` module).
//!
//! The session addressed by these calls is the one named by the request's
//! session cookie, or the one created earlier in the same request. Session
//! records live in the shared store; everything else here is per request.

use guest_runtime_common::RuntimeError;
use guest_runtime_core::context::ResponseCookie;
use guest_runtime_core::{AuthContext, GuestState, NewSession};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use crate::bridge::{flag, link_error, text_arg, text_result};

const MODULE: &str = "session";

/// Parse guest-supplied claims; anything but a JSON object is empty.
pub fn parse_claims(json: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(claims)) => claims,
        Ok(_) | Err(_) if json.trim().is_empty() => Map::new(),
        _ => {
            warn!("Session claims are not a JSON object; ignoring");
            Map::new()
        }
    }
}

/// Create a session for `data`, bind it to this request and issue its cookie.
pub fn create_session(state: &mut GuestState, data: NewSession) -> String {
    let services = state.services().clone();
    let settings = services.settings();
    let ttl = settings.session_ttl_secs;

    let id = services.sessions().create(data.clone(), Some(ttl));
    let cookie = ResponseCookie::session(&settings.session_cookie, &id, ttl, settings.secure_cookie);
    if state.response.add_cookie(cookie).is_err() {
        warn!(request_id = %state.request_id, "Session created after response was sealed");
    }

    state.request.session_id = Some(id.clone());
    state.request.auth = Some(AuthContext {
        user_id: data.user_id,
        role: data.role,
        session_id: id.clone(),
    });

    debug!(request_id = %state.request_id, "Session created");
    id
}

/// Destroy the request's session and expire its cookie.
pub fn destroy_session(state: &mut GuestState) -> bool {
    let Some(id) = state.request.session_id.take() else {
        return false;
    };
    state.request.auth = None;

    let cookie = ResponseCookie::expired(&state.services().settings().session_cookie);
    let _ = state.response.add_cookie(cookie);

    state.services().sessions().destroy(&id)
}

/// Reset the request's session lifetime; `ttl_secs <= 0` uses the default.
pub fn extend_session(state: &mut GuestState, ttl_secs: i64) -> bool {
    let Some(id) = state.request.session_id.clone() else {
        return false;
    };

    let services = state.services().clone();
    let settings = services.settings();
    let ttl = u64::try_from(ttl_secs)
        .ok()
        .filter(|ttl| *ttl > 0)
        .unwrap_or(settings.session_ttl_secs);

    if !services.sessions().extend(&id, ttl) {
        return false;
    }

    let cookie = ResponseCookie::session(&settings.session_cookie, &id, ttl, settings.secure_cookie);
    let _ = state.response.add_cookie(cookie);
    true
}

/// The request's live session record as JSON, or `null`.
pub fn session_json(state: &GuestState) -> String {
    state
        .request
        .session_id
        .as_deref()
        .and_then(|id| state.services().sessions().get(id))
        .and_then(|record| serde_json::to_string(&record).ok())
        .unwrap_or_else(|| "null".to_string())
}

fn session_id(caller: &Caller<'_, GuestState>) -> Option<String> {
    caller.data().request.session_id.clone()
}

fn auth<'a>(caller: &'a Caller<'_, GuestState>) -> Option<&'a AuthContext> {
    caller.data().request.auth.as_ref()
}

/// Register the session and auth capabilities.
#[allow(clippy::too_many_lines)]
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            MODULE,
            "_session_create",
            |mut caller: Caller<'_, GuestState>,
             (user_ptr, user_len, role_ptr, role_len, claims_ptr, claims_len): (
                i32,
                i32,
                i32,
                i32,
                i32,
                i32,
            )| {
                Box::new(async move {
                    let name = "_session_create";
                    let data = NewSession {
                        user_id: text_arg(&mut caller, name, user_ptr, user_len),
                        role: text_arg(&mut caller, name, role_ptr, role_len),
                        claims: parse_claims(&text_arg(&mut caller, name, claims_ptr, claims_len)),
                    };
                    let id = create_session(caller.data_mut(), data);
                    text_result(&mut caller, name, &id).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_session_create", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "_session_get",
            |mut caller: Caller<'_, GuestState>, (): ()| {
                Box::new(async move {
                    let json = session_json(caller.data());
                    text_result(&mut caller, "_session_get", &json).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_session_get", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_session_destroy",
            |mut caller: Caller<'_, GuestState>| flag(destroy_session(caller.data_mut())),
        )
        .map_err(|e| link_error(MODULE, "_session_destroy", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_session_extend",
            |mut caller: Caller<'_, GuestState>, ttl_secs: i64| {
                flag(extend_session(caller.data_mut(), ttl_secs))
            },
        )
        .map_err(|e| link_error(MODULE, "_session_extend", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_session_store",
            |mut caller: Caller<'_, GuestState>,
             key_ptr: i32,
             key_len: i32,
             value_ptr: i32,
             value_len: i32| {
                let key = text_arg(&mut caller, "_session_store", key_ptr, key_len);
                let value = text_arg(&mut caller, "_session_store", value_ptr, value_len);
                let stored = session_id(&caller).is_some_and(|id| {
                    caller.data().services().sessions().store_value(&id, &key, value)
                });
                flag(stored)
            },
        )
        .map_err(|e| link_error(MODULE, "_session_store", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "_session_get_value",
            |mut caller: Caller<'_, GuestState>, (key_ptr, key_len): (i32, i32)| {
                Box::new(async move {
                    let key = text_arg(&mut caller, "_session_get_value", key_ptr, key_len);
                    let value = session_id(&caller)
                        .and_then(|id| caller.data().services().sessions().get_value(&id, &key))
                        .unwrap_or_default();
                    text_result(&mut caller, "_session_get_value", &value).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_session_get_value", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_session_delete_value",
            |mut caller: Caller<'_, GuestState>, key_ptr: i32, key_len: i32| {
                let key = text_arg(&mut caller, "_session_delete_value", key_ptr, key_len);
                let deleted = session_id(&caller).is_some_and(|id| {
                    caller.data().services().sessions().delete_value(&id, &key)
                });
                flag(deleted)
            },
        )
        .map_err(|e| link_error(MODULE, "_session_delete_value", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_session_has",
            |mut caller: Caller<'_, GuestState>, key_ptr: i32, key_len: i32| {
                let key = text_arg(&mut caller, "_session_has", key_ptr, key_len);
                let present = session_id(&caller)
                    .is_some_and(|id| caller.data().services().sessions().has_value(&id, &key));
                flag(present)
            },
        )
        .map_err(|e| link_error(MODULE, "_session_has", &e))?;

    register_auth(linker)
}

fn register_auth(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            MODULE,
            "_auth_user_id",
            |mut caller: Caller<'_, GuestState>, (): ()| {
                Box::new(async move {
                    let user_id = auth(&caller).map(|a| a.user_id.clone()).unwrap_or_default();
                    text_result(&mut caller, "_auth_user_id", &user_id).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_auth_user_id", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "_auth_role",
            |mut caller: Caller<'_, GuestState>, (): ()| {
                Box::new(async move {
                    let role = auth(&caller).map(|a| a.role.clone()).unwrap_or_default();
                    text_result(&mut caller, "_auth_role", &role).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_auth_role", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_auth_is_authenticated",
            |caller: Caller<'_, GuestState>| flag(auth(&caller).is_some()),
        )
        .map_err(|e| link_error(MODULE, "_auth_is_authenticated", &e))?;

    linker
        .func_wrap(
            MODULE,
            "_auth_has_role",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
                let role = text_arg(&mut caller, "_auth_has_role", ptr, len);
                flag(auth(&caller).is_some_and(|a| a.role == role))
            },
        )
        .map_err(|e| link_error(MODULE, "_auth_has_role", &e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_runtime_core::{HostServices, RequestContext};

    fn state(services: &HostServices, request: RequestContext) -> GuestState {
        GuestState::for_request("test", request, services.clone())
    }

    fn alice() -> NewSession {
        NewSession {
            user_id: "alice".into(),
            role: "admin".into(),
            claims: parse_claims(r#"{"plan":"pro"}"#),
        }
    }

    #[test]
    fn test_parse_claims() {
        assert_eq!(parse_claims(r#"{"a":1}"#).len(), 1);
        assert!(parse_claims("").is_empty());
        assert!(parse_claims("[1,2]").is_empty());
        assert!(parse_claims("{oops").is_empty());
    }

    #[test]
    fn test_create_binds_session_and_sets_cookie() {
        let services = HostServices::default();
        let mut state = state(&services, RequestContext::new("POST", "/login"));

        let id = create_session(&mut state, alice());

        assert_eq!(state.request.session_id.as_deref(), Some(id.as_str()));
        assert_eq!(state.request.auth.as_ref().map(|a| a.role.as_str()), Some("admin"));
        assert!(services.sessions().get(&id).is_some());

        let cookie = &state.response.cookies()[0];
        assert_eq!(cookie.name, "session_id");
        assert_eq!(cookie.value, id);
        assert!(cookie.http_only);
        assert_eq!(cookie.max_age, Some(3600));

        let json: Value = serde_json::from_str(&session_json(&state)).unwrap();
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["claims"]["plan"], "pro");
    }

    #[test]
    fn test_destroy_expires_cookie() {
        let services = HostServices::default();
        let id = services.sessions().create(alice(), None);
        let mut state = state(
            &services,
            RequestContext::new("POST", "/logout").with_cookie("session_id", id.clone()),
        );
        state.request.session_id = Some(id.clone());

        assert!(destroy_session(&mut state));
        assert!(services.sessions().get(&id).is_none());
        assert_eq!(state.response.cookies()[0].max_age, Some(0));
        assert_eq!(session_json(&state), "null");

        assert!(!destroy_session(&mut state));
    }

    #[test]
    fn test_extend_without_session() {
        let services = HostServices::default();
        let mut state = state(&services, RequestContext::default());

        assert!(!extend_session(&mut state, 60));
        assert!(state.response.cookies().is_empty());
    }

    #[test]
    fn test_extend_refreshes_cookie() {
        let services = HostServices::default();
        let id = services.sessions().create(alice(), None);
        let mut state = state(&services, RequestContext::default());
        state.request.session_id = Some(id);

        assert!(extend_session(&mut state, 120));
        assert_eq!(state.response.cookies()[0].max_age, Some(120));
    }
}
