//! Guest instance management.
//!
//! This module provides [`InstanceRunner`], which owns the linker with every
//! capability registered and knows how to:
//!
//! 1. Create a store for a fresh instance
//! 2. Instantiate the compiled module into it
//! 3. Run the startup instance that collects route registrations
//! 4. Call the export behind a route's handler index

use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use wasmtime::{Func, Instance, Linker, Store, Trap, Val, ValType};

use crate::module::handler_export_name;
use crate::router::RouteTable;
use crate::services::HostServices;
use crate::store::{GuestState, create_store, get_remaining_fuel};
use crate::{CompiledModule, WasmEngine};
use guest_runtime_common::{ExecutionConfig, RouteError, RuntimeError};

/// Instance lifecycle manager.
///
/// Shared by every request; each call works on its own [`Store`], so no
/// instance ever outlives the request that created it.
pub struct InstanceRunner {
    engine: WasmEngine,
    linker: Linker<GuestState>,
    config: ExecutionConfig,
}

impl InstanceRunner {
    /// Create a runner with an empty linker.
    pub fn new(engine: WasmEngine, config: ExecutionConfig) -> Self {
        let linker = Linker::new(engine.inner());

        Self {
            engine,
            linker,
            config,
        }
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register capability functions.
    pub fn linker_mut(&mut self) -> &mut Linker<GuestState> {
        &mut self.linker
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Create a store with this runner's execution limits.
    pub fn new_store(&self, state: GuestState) -> Result<Store<GuestState>, RuntimeError> {
        create_store(&self.engine, &self.config, state)
    }

    /// Instantiate `module` into `store`.
    pub async fn instantiate(
        &self,
        module: &CompiledModule,
        store: &mut Store<GuestState>,
    ) -> Result<Instance, RuntimeError> {
        let start = Instant::now();

        let instance = self
            .linker
            .instantiate_async(&mut *store, module.inner())
            .await
            .map_err(|e| self.classify(&e))?;

        let elapsed = start.elapsed();
        store.data_mut().metrics.instantiate = Some(elapsed);
        debug!(duration_us = elapsed.as_micros(), "Guest instantiated");

        Ok(instance)
    }

    /// Run the guest's startup code and freeze the routes it registers.
    ///
    /// A disposable instance runs the module's initialization entrypoint while
    /// registration is open; the instance is dropped afterwards.
    #[instrument(skip_all, fields(module = %module.content_hash()))]
    pub async fn collect_routes(
        &self,
        module: &CompiledModule,
        services: HostServices,
    ) -> Result<RouteTable, RuntimeError> {
        let mut store = self.new_store(GuestState::for_startup(services))?;

        let startup = async {
            let instance = self.instantiate(module, &mut store).await?;
            if let Some(init) = &module.abi().init {
                debug!(entrypoint = %init, "Running initialization entrypoint");
                self.call_export(&mut store, &instance, init).await?;
            }
            Ok::<_, RuntimeError>(())
        };

        tokio::time::timeout(self.config.timeout(), startup)
            .await
            .map_err(|_| RuntimeError::ExecutionTimeout {
                duration_ms: self.config.timeout_ms,
            })??;

        let table = store.data_mut().take_routes().freeze();
        info!(routes = table.len(), "Route table frozen");

        Ok(table)
    }

    /// Call the handler export for `handler_index`.
    ///
    /// Returns the pointer the handler returned, if it returns one.
    pub async fn call_handler(
        &self,
        store: &mut Store<GuestState>,
        instance: &Instance,
        handler_index: u32,
    ) -> Result<Option<i32>, RuntimeError> {
        let name = handler_export_name(handler_index);
        let start = Instant::now();
        let initial_fuel = get_remaining_fuel(store).unwrap_or(0);

        let result = self.call_export(store, instance, &name).await;

        let remaining = get_remaining_fuel(store).unwrap_or(0);
        let metrics = &mut store.data_mut().metrics;
        metrics.execute = Some(start.elapsed());
        metrics.fuel_consumed = initial_fuel.saturating_sub(remaining);

        result
    }

    /// Call a parameterless export returning nothing or one `i32`.
    async fn call_export(
        &self,
        store: &mut Store<GuestState>,
        instance: &Instance,
        name: &str,
    ) -> Result<Option<i32>, RuntimeError> {
        let func = instance
            .get_func(&mut *store, name)
            .ok_or_else(|| RuntimeError::handler_fault(format!("export '{name}' not found")))?;

        let mut results = result_slots(&func, store, name)?;

        match func.call_async(&mut *store, &[], &mut results).await {
            Ok(()) => Ok(results.first().and_then(Val::i32)),
            Err(e) if is_clean_exit(&e) => Ok(None),
            Err(e) => Err(self.classify(&e)),
        }
    }

    /// Map a wasmtime error onto the runtime taxonomy.
    ///
    /// Only the root cause is kept; wasm backtraces stay in the logs.
    fn classify(&self, error: &wasmtime::Error) -> RuntimeError {
        if let Some(trap) = error.downcast_ref::<Trap>() {
            match trap {
                Trap::OutOfFuel => {
                    warn!("Execution terminated: fuel exhausted");
                    return RuntimeError::FuelExhausted;
                }
                Trap::Interrupt => {
                    warn!("Execution terminated: epoch deadline reached");
                    return RuntimeError::ExecutionTimeout {
                        duration_ms: self.config.timeout_ms,
                    };
                }
                _ => {}
            }
        }

        if let Some(route_error) = error.downcast_ref::<RouteError>() {
            return RuntimeError::Route(route_error.clone());
        }

        debug!(error = ?error, "Guest execution failed");
        RuntimeError::handler_fault(error.root_cause().to_string())
    }
}

/// Allocate result slots for a parameterless export.
fn result_slots(
    func: &Func,
    store: &Store<GuestState>,
    name: &str,
) -> Result<Vec<Val>, RuntimeError> {
    let ty = func.ty(store);

    if ty.params().len() != 0 {
        return Err(RuntimeError::handler_fault(format!(
            "export '{name}' must take no parameters"
        )));
    }

    ty.results()
        .map(|result| match result {
            ValType::I32 => Ok(Val::I32(0)),
            other => Err(RuntimeError::handler_fault(format!(
                "export '{name}' returns unsupported type {other}"
            ))),
        })
        .collect()
}

/// `proc_exit(0)` from a WASI entrypoint is a normal return.
fn is_clean_exit(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<wasmtime_wasi::I32Exit>()
        .is_some_and(|exit| exit.0 == 0)
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner")
            .field("engine", &self.engine)
            .field("timeout_ms", &self.config.timeout_ms)
            .finish_non_exhaustive()
    }
}
