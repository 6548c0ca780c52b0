//! Wiring the capability catalog onto a Wasmtime linker.
//!
//! Guests import from these modules:
//!
//! | Module | Capabilities |
//! |--------|--------------|
//! | `wasi_snapshot_preview1` | WASI preview 1 (stdio inherited) |
//! | `env` | console, value helpers, environment, clock |
//! | `memory_runtime` | allocation tracking and scopes |
//! | `http` | route registration, response shaping, request readers, outbound verbs |
//! | `session` | sessions and authentication |
//! | `crypto` | passwords, tokens, digests, randomness |
//! | `db` | query, execute, transactions |
//! | `file` | sandboxed filesystem |

use std::sync::Arc;

use guest_runtime_common::{ExecutionConfig, HostConfig, RuntimeError};
use guest_runtime_core::{GuestState, HostServices, HostSettings, InstanceRunner, SessionStore, WasmEngine};
use tracing::info;
use wasmtime::Linker;

use crate::{HttpOutboundHost, auth, crypto, database, files, http_api, http_outbound, logging, memory_runtime, system, values};

/// Register every capability, WASI included.
pub fn register_all(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, GuestState::wasi_mut)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register WASI: {e}")))?;

    logging::register(linker)?;
    values::register(linker)?;
    system::register(linker)?;
    memory_runtime::register(linker)?;
    http_api::register_response(linker)?;
    http_api::register_request(linker)?;
    http_outbound::register(linker)?;
    auth::register(linker)?;
    crypto::register(linker)?;
    database::register(linker)?;
    files::register(linker)?;

    Ok(())
}

/// Build an [`InstanceRunner`] with the full catalog linked.
pub fn create_instance_runner(
    engine: WasmEngine,
    config: ExecutionConfig,
) -> Result<InstanceRunner, RuntimeError> {
    let mut runner = InstanceRunner::new(engine, config);
    register_all(runner.linker_mut())?;
    Ok(runner)
}

/// Assemble the shared services described by `config`.
///
/// The database is opened when a URL is configured and outbound HTTP is
/// enabled when at least one host is allowed.
pub fn host_services(config: &HostConfig, store: Arc<SessionStore>) -> Result<HostServices, RuntimeError> {
    let mut services = HostServices::new(HostSettings::from_config(config), store);

    if let Some(url) = config.database_url.as_deref().filter(|url| !url.is_empty()) {
        let driver = database::connect(url)?;
        info!(engine = driver.engine(), "Database connected");
        services = services.with_database(driver);
    }

    if config.http.allowed_hosts.iter().any(|host| !host.trim().is_empty()) {
        let client = HttpOutboundHost::from_config(&config.http)?;
        info!(
            allowed_hosts = ?config.http.allowed_hosts,
            max_requests = config.http.max_requests,
            "Outbound HTTP enabled"
        );
        services = services.with_outbound(Arc::new(client));
    }

    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_runtime_common::{DatabaseError, EngineConfig, OutboundHttpConfig};

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_register_all() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        assert!(register_all(&mut linker).is_ok());
    }

    #[test]
    fn test_register_all_twice_conflicts() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        register_all(&mut linker).unwrap();
        assert!(matches!(register_all(&mut linker), Err(RuntimeError::InvalidConfig { .. })));
    }

    #[test]
    fn test_create_instance_runner() {
        assert!(create_instance_runner(engine(), ExecutionConfig::default()).is_ok());
    }

    #[test]
    fn test_host_services_defaults() {
        let services = host_services(&HostConfig::default(), Arc::new(SessionStore::default())).unwrap();

        assert!(matches!(services.database(), Err(DatabaseError::Unavailable)));
        assert!(services.outbound().is_none());
    }

    #[test]
    fn test_host_services_with_collaborators() {
        let config = HostConfig {
            database_url: Some("sqlite::memory:".into()),
            http: OutboundHttpConfig {
                allowed_hosts: vec!["api.example.com".into()],
                max_requests: 3,
                ..OutboundHttpConfig::default()
            },
            ..HostConfig::default()
        };
        let services = host_services(&config, Arc::new(SessionStore::default())).unwrap();

        assert_eq!(services.database().unwrap().engine(), "sqlite");
        assert_eq!(services.outbound().unwrap().max_requests(), 3);
    }

    #[test]
    fn test_host_services_rejects_unknown_scheme() {
        let config = HostConfig {
            database_url: Some("postgres://localhost/app".into()),
            ..HostConfig::default()
        };

        let err = host_services(&config, Arc::new(SessionStore::default())).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Database(DatabaseError::UnsupportedScheme { .. })
        ));
    }
}
