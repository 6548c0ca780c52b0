//! The shared Wasmtime engine.
//!
//! One [`WasmEngine`] serves the whole process. Every request gets a fresh
//! store and instance, so the engine only carries compilation settings and
//! the instance allocator.

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, OptLevel, PoolingAllocationConfig};

use guest_runtime_common::{EngineConfig, RuntimeError};

const MIB: usize = 1024 * 1024;

/// Cheaply clonable handle to the process-wide engine.
///
/// Async support is always on: capability calls suspend the guest while the
/// host awaits database, filesystem or HTTP I/O. Fuel metering is always
/// compiled in; whether a store is given a budget is an execution setting.
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Fails with [`RuntimeError::InvalidConfig`] when Wasmtime rejects the
    /// settings, e.g. a pooling allocator the host cannot reserve memory for.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let engine = Engine::new(&wasmtime_config(config))
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}")))?;

        info!(
            pooling = config.pooling_allocator,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    pub fn shared(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the epoch by one tick.
    ///
    /// The server ticks every millisecond, so store deadlines are counted in
    /// milliseconds.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

fn wasmtime_config(config: &EngineConfig) -> Config {
    let mut wasmtime = Config::new();
    wasmtime
        .async_support(true)
        .consume_fuel(true)
        .epoch_interruption(config.epoch_interruption)
        .cranelift_opt_level(OptLevel::Speed);

    if config.pooling_allocator {
        wasmtime.allocation_strategy(InstanceAllocationStrategy::Pooling(pooling(config)));
        info!(
            max_instances = config.max_instances,
            instance_memory_mb = config.instance_memory_mb,
            "Pooling allocator enabled"
        );
    }

    wasmtime
}

/// Slots for `max_instances` concurrent requests, one memory and one table each.
fn pooling(config: &EngineConfig) -> PoolingAllocationConfig {
    let mut pooling = PoolingAllocationConfig::default();
    pooling
        .total_core_instances(config.max_instances)
        .total_memories(config.max_instances)
        .total_tables(config.max_instances)
        .max_memory_size(config.instance_memory_mb as usize * MIB);
    pooling
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("max_instances", &self.config.max_instances)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_demand() -> EngineConfig {
        EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_pooling_engine() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_clones_share_one_engine() {
        let engine = WasmEngine::new(&on_demand()).unwrap();
        let clone = engine.clone();

        assert!(Arc::ptr_eq(&engine.shared(), &clone.shared()));
        assert!(!clone.is_pooling_enabled());
    }

    #[test]
    fn test_compiles_guest_code() {
        let engine = WasmEngine::new(&on_demand()).unwrap();

        let module = wasmtime::Module::new(engine.inner(), r#"(module (func (export "_start")))"#);

        assert!(module.is_ok());
        engine.increment_epoch();
    }

    #[test]
    fn test_debug_lists_settings() {
        let engine = WasmEngine::new(&on_demand()).unwrap();

        let rendered = format!("{engine:?}");
        assert!(rendered.contains("pooling_allocator: false"));
        assert!(rendered.contains("epoch_interruption"));
    }
}
