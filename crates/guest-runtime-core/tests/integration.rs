//! End-to-end tests: a guest linked against the full capability catalog.
//!
//! The guest registers its routes from `_start` through `http::_http_route`
//! and answers requests through the request readers, the session helpers and
//! the memory scope calls, exactly as a compiled application would.

use std::sync::Arc;

use guest_runtime_common::{EngineConfig, ExecutionConfig, HostConfig};
use guest_runtime_core::{
    CompiledModule, LifecycleState, NewSession, RequestContext, RequestLifecycle, SessionStore, WasmEngine,
};
use guest_runtime_host::{create_instance_runner, host_services};

const GUEST_WAT: &str = r#"
    (module
        (import "http" "_http_route" (func $route (param i32 i32 i32 i32 i32) (result i32)))
        (import "http" "_http_route_protected"
            (func $route_protected (param i32 i32 i32 i32 i32 i32 i32) (result i32)))
        (import "http" "_http_set_status" (func $set_status (param i32)))
        (import "http" "_req_param" (func $req_param (param i32 i32) (result i32)))
        (import "session" "_session_create"
            (func $session_create (param i32 i32 i32 i32 i32 i32) (result i32)))
        (import "session" "_auth_user_id" (func $auth_user_id (result i32)))
        (import "memory_runtime" "mem_alloc" (func $mem_alloc (param i32) (result i32)))
        (import "memory_runtime" "mem_scope_push" (func $scope_push))
        (import "memory_runtime" "mem_scope_pop" (func $scope_pop))

        (memory (export "memory") 1)
        (global $next (mut i32) (i32.const 4096))
        (global $frees (mut i32) (i32.const 0))

        (func (export "malloc") (param $size i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $next))
            (global.set $next (i32.add (global.get $next) (local.get $size)))
            (local.get $ptr))
        (func (export "free") (param $ptr i32)
            (global.set $frees (i32.add (global.get $frees) (i32.const 1))))

        (data (i32.const 16) "GET")
        (data (i32.const 32) "/health")
        (data (i32.const 48) "/users/me")
        (data (i32.const 64) "/users/:id")
        (data (i32.const 80) "/admin")
        (data (i32.const 96) "admin")
        (data (i32.const 112) "id")
        (data (i32.const 128) "POST")
        (data (i32.const 144) "/login")
        (data (i32.const 160) "alice")
        (data (i32.const 176) "{}")
        (data (i32.const 192) "/late")
        (data (i32.const 208) "/scoped")
        (data (i32.const 224) "/whoami")
        (data (i32.const 256) "\14\00\00\00{\"status\":\"healthy\"}")
        (data (i32.const 320) "\02\00\00\00me")
        (data (i32.const 336) "\02\00\00\00ok")

        (func (export "_start")
            (drop (call $route (i32.const 16) (i32.const 3) (i32.const 32) (i32.const 7) (i32.const 0)))
            (drop (call $route (i32.const 16) (i32.const 3) (i32.const 48) (i32.const 9) (i32.const 1)))
            (drop (call $route (i32.const 16) (i32.const 3) (i32.const 64) (i32.const 10) (i32.const 2)))
            (drop (call $route_protected
                (i32.const 16) (i32.const 3) (i32.const 80) (i32.const 6) (i32.const 3)
                (i32.const 96) (i32.const 5)))
            (drop (call $route (i32.const 128) (i32.const 4) (i32.const 144) (i32.const 6) (i32.const 4)))
            (drop (call $route (i32.const 16) (i32.const 3) (i32.const 192) (i32.const 5) (i32.const 5)))
            (drop (call $route (i32.const 16) (i32.const 3) (i32.const 208) (i32.const 7) (i32.const 6)))
            (drop (call $route (i32.const 16) (i32.const 3) (i32.const 224) (i32.const 7) (i32.const 7))))

        ;; GET /health
        (func (export "__route_handler_0") (result i32) (i32.const 256))

        ;; GET /users/me
        (func (export "__route_handler_1") (result i32) (i32.const 320))

        ;; GET /users/:id echoes the decoded parameter
        (func (export "__route_handler_2") (result i32)
            (call $req_param (i32.const 112) (i32.const 2)))

        ;; GET /admin
        (func (export "__route_handler_3") (result i32) (i32.const 336))

        ;; POST /login
        (func (export "__route_handler_4") (result i32)
            (drop (call $session_create
                (i32.const 160) (i32.const 5) (i32.const 96) (i32.const 5) (i32.const 176) (i32.const 2)))
            (call $set_status (i32.const 201))
            (i32.const 336))

        ;; GET /late registers a route after startup
        (func (export "__route_handler_5") (result i32)
            (call $route (i32.const 16) (i32.const 3) (i32.const 192) (i32.const 5) (i32.const 0)))

        ;; GET /scoped reports how many scoped buffers were freed as 200 + n
        (func (export "__route_handler_6") (result i32)
            (call $scope_push)
            (drop (call $mem_alloc (i32.const 8)))
            (drop (call $mem_alloc (i32.const 16)))
            (call $scope_pop)
            (call $set_status (i32.add (i32.const 200) (global.get $frees)))
            (i32.const 336))

        ;; GET /whoami echoes the authenticated user id
        (func (export "__route_handler_7") (result i32)
            (call $auth_user_id))
    )
"#;

async fn lifecycle() -> RequestLifecycle {
    let engine = WasmEngine::new(&EngineConfig {
        pooling_allocator: false,
        epoch_interruption: false,
        ..Default::default()
    })
    .unwrap();
    let module = CompiledModule::from_wat(engine.inner(), GUEST_WAT).unwrap();
    let runner = create_instance_runner(engine, ExecutionConfig::default()).unwrap();
    let services = host_services(&HostConfig::default(), Arc::new(SessionStore::default())).unwrap();

    RequestLifecycle::bootstrap(Arc::new(runner), module, services)
        .await
        .unwrap()
}

fn session_for(lc: &RequestLifecycle, role: &str) -> String {
    lc.services().sessions().create(
        NewSession {
            user_id: format!("{role}-user"),
            role: role.into(),
            ..Default::default()
        },
        None,
    )
}

#[tokio::test]
async fn test_startup_registers_routes_in_order() {
    let lc = lifecycle().await;

    let patterns: Vec<String> = lc.routes().describe().into_iter().map(|r| r.pattern).collect();
    assert_eq!(
        patterns,
        ["/health", "/users/me", "/users/:id", "/admin", "/login", "/late", "/scoped", "/whoami"]
    );
}

#[tokio::test]
async fn test_health() {
    let lc = lifecycle().await;

    let outcome = lc.handle("r1", RequestContext::new("GET", "/health")).await;

    assert_eq!(outcome.state, LifecycleState::Responded);
    assert_eq!(outcome.response.status(), 200);
    assert_eq!(outcome.response.body(), Some(r#"{"status":"healthy"}"#));
}

#[tokio::test]
async fn test_path_parameter_is_decoded() {
    let lc = lifecycle().await;

    let outcome = lc.handle("r1", RequestContext::new("GET", "/users/42%20x")).await;

    assert_eq!(outcome.response.status(), 200);
    assert_eq!(outcome.response.body(), Some("42 x"));
}

#[tokio::test]
async fn test_first_registered_route_wins() {
    let lc = lifecycle().await;

    let me = lc.handle("r1", RequestContext::new("GET", "/users/me")).await;
    let other = lc.handle("r2", RequestContext::new("GET", "/users/7")).await;

    assert_eq!(me.response.body(), Some("me"));
    assert_eq!(other.response.body(), Some("7"));
}

#[tokio::test]
async fn test_protected_route() {
    let lc = lifecycle().await;

    let anonymous = lc.handle("r1", RequestContext::new("GET", "/admin")).await;
    assert_eq!(anonymous.response.status(), 401);

    let user = session_for(&lc, "user");
    let request = RequestContext::new("GET", "/admin").with_cookie("session_id", user);
    assert_eq!(lc.handle("r2", request).await.response.status(), 403);

    let admin = session_for(&lc, "admin");
    let request = RequestContext::new("GET", "/admin").with_cookie("session_id", admin);
    let outcome = lc.handle("r3", request).await;
    assert_eq!(outcome.response.status(), 200);
    assert_eq!(outcome.response.body(), Some("ok"));
}

#[tokio::test]
async fn test_login_creates_session_cookie() {
    let lc = lifecycle().await;

    let outcome = lc.handle("r1", RequestContext::new("POST", "/login")).await;

    assert_eq!(outcome.response.status(), 201);
    let cookie = &outcome.response.cookies()[0];
    assert_eq!(cookie.name, "session_id");

    let record = lc.services().sessions().get(&cookie.value).unwrap();
    assert_eq!(record.user_id, "alice");
    assert_eq!(record.role, "admin");

    let request = RequestContext::new("GET", "/admin").with_cookie("session_id", cookie.value.clone());
    assert_eq!(lc.handle("r2", request).await.response.status(), 200);
}

#[tokio::test]
async fn test_auth_user_id_on_public_route() {
    let lc = lifecycle().await;

    let anonymous = lc.handle("r1", RequestContext::new("GET", "/whoami")).await;
    assert_eq!(anonymous.response.status(), 200);
    assert_ne!(anonymous.response.body(), Some("admin-user"));

    let admin = session_for(&lc, "admin");
    let request = RequestContext::new("GET", "/whoami").with_cookie("session_id", admin);
    let outcome = lc.handle("r2", request).await;
    assert_eq!(outcome.response.body(), Some("admin-user"));
}

#[tokio::test]
async fn test_scope_pop_frees_through_guest() {
    let lc = lifecycle().await;

    let outcome = lc.handle("r1", RequestContext::new("GET", "/scoped")).await;

    assert_eq!(outcome.response.status(), 202);
}

#[tokio::test]
async fn test_late_route_registration_fails_request() {
    let lc = lifecycle().await;

    let outcome = lc.handle("r1", RequestContext::new("GET", "/late")).await;

    assert_eq!(outcome.state, LifecycleState::Errored);
    assert_eq!(outcome.response.status(), 500);
    assert_eq!(lc.routes().len(), 8);

    let after = lc.handle("r2", RequestContext::new("GET", "/health")).await;
    assert_eq!(after.response.status(), 200);
}

#[tokio::test]
async fn test_concurrent_requests_are_isolated() {
    let lc = Arc::new(lifecycle().await);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let lc = Arc::clone(&lc);
            tokio::spawn(async move {
                let outcome = lc
                    .handle(&format!("r{i}"), RequestContext::new("GET", &format!("/users/{i}")))
                    .await;
                (i, outcome)
            })
        })
        .collect();

    for handle in handles {
        let (i, outcome) = handle.await.unwrap();
        assert_eq!(outcome.response.body(), Some(i.to_string().as_str()));
    }
}
