//! Guest module compilation and ABI validation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that compiles the guest binary once at startup and checks that it satisfies
//! the host ABI ([`GuestAbi`]) before any instance is created.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{info, instrument, warn};
use wasmtime::{Engine, ExternType, FuncType, Module, ValType};

use guest_runtime_common::RuntimeError;

use crate::memory::{ALLOCATOR_EXPORTS, DEALLOCATOR_EXPORTS, MEMORY_EXPORT};

/// Initialization entrypoints, in lookup order.
pub const INIT_EXPORTS: [&str; 4] = ["main", "_start", "start", "init"];

/// Export name of the handler registered under `index`.
pub fn handler_export_name(index: u32) -> String {
    format!("__route_handler_{index}")
}

/// The exports the host relies on, resolved once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestAbi {
    /// Name of the allocator export (`(i32) -> i32`).
    pub allocator: String,
    /// Name of the deallocator export (`(i32) -> ()`), if any.
    pub deallocator: Option<String>,
    /// Name of the initialization entrypoint, if any.
    pub init: Option<String>,
}

impl GuestAbi {
    /// Inspect a compiled module's exports.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidGuest`] if the module does not export a
    /// memory or an allocator with the expected signature.
    pub fn inspect(module: &Module) -> Result<Self, RuntimeError> {
        let has_memory = module
            .exports()
            .any(|e| e.name() == MEMORY_EXPORT && matches!(e.ty(), ExternType::Memory(_)));
        if !has_memory {
            return Err(RuntimeError::invalid_guest(format!(
                "guest must export a memory named '{MEMORY_EXPORT}'"
            )));
        }

        let allocator = ALLOCATOR_EXPORTS
            .iter()
            .find(|name| export_func(module, name).is_some_and(|ty| is_allocator(&ty)))
            .ok_or_else(|| {
                RuntimeError::invalid_guest(format!(
                    "guest must export an allocator ({}) with signature (i32) -> i32",
                    ALLOCATOR_EXPORTS.join(" or ")
                ))
            })?;

        let deallocator = DEALLOCATOR_EXPORTS
            .iter()
            .find(|name| export_func(module, name).is_some_and(|ty| is_deallocator(&ty)))
            .map(ToString::to_string);

        let init = INIT_EXPORTS
            .iter()
            .find(|name| export_func(module, name).is_some_and(|ty| ty.params().len() == 0))
            .map(ToString::to_string);

        if init.is_none() {
            warn!("Guest exports no initialization entrypoint; no routes will be registered");
        }

        Ok(Self {
            allocator: (*allocator).to_string(),
            deallocator,
            init,
        })
    }
}

/// A compiled guest module.
///
/// Immutable after compilation and shared read-only by every instance.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Exports resolved at load time.
    abi: GuestAbi,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a guest module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails or the guest ABI is not satisfied.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Guest module compilation failed: {e}"))
        })?;

        Self::finish(module, compute_hash(bytes), start)
    }

    /// Read and compile a guest module from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or compiled.
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(engine, &bytes)
    }

    /// Compile a guest module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails or the guest ABI is not satisfied.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        Self::finish(module, compute_hash(wat.as_bytes()), start)
    }

    fn finish(module: Module, content_hash: String, start: Instant) -> Result<Self, RuntimeError> {
        let abi = GuestAbi::inspect(&module)?;

        info!(
            content_hash = %content_hash,
            allocator = %abi.allocator,
            init = ?abi.init,
            duration_ms = start.elapsed().as_millis(),
            "Guest module compiled"
        );

        Ok(Self {
            module,
            abi,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Get the resolved guest ABI.
    pub fn abi(&self) -> &GuestAbi {
        &self.abi
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("abi", &self.abi)
            .finish_non_exhaustive()
    }
}

fn export_func(module: &Module, name: &str) -> Option<FuncType> {
    match module.get_export(name)? {
        ExternType::Func(ty) => Some(ty),
        _ => None,
    }
}

fn is_allocator(ty: &FuncType) -> bool {
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    matches!(params.as_slice(), [ValType::I32]) && matches!(results.as_slice(), [ValType::I32])
}

fn is_deallocator(ty: &FuncType) -> bool {
    let params: Vec<ValType> = ty.params().collect();
    matches!(params.as_slice(), [ValType::I32]) && ty.results().len() == 0
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use guest_runtime_common::EngineConfig;

    const GUEST_WAT: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "malloc") (param i32) (result i32) (i32.const 1024))
            (func (export "free") (param i32))
            (func (export "init"))
        )
    "#;

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = CompiledModule::validate_wasm_header(&[0x00, 0x61]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let result = CompiledModule::validate_wasm_header(bad_wasm);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_guest_abi_resolved() {
        let module = CompiledModule::from_wat(engine().inner(), GUEST_WAT).unwrap();

        assert_eq!(module.abi().allocator, "malloc");
        assert_eq!(module.abi().deallocator.as_deref(), Some("free"));
        assert_eq!(module.abi().init.as_deref(), Some("init"));
    }

    #[test]
    fn test_init_lookup_order_prefers_main() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "alloc") (param i32) (result i32) (i32.const 8))
                (func (export "init"))
                (func (export "main"))
            )
        "#;
        let module = CompiledModule::from_wat(engine().inner(), wat).unwrap();

        assert_eq!(module.abi().allocator, "alloc");
        assert_eq!(module.abi().init.as_deref(), Some("main"));
        assert!(module.abi().deallocator.is_none());
    }

    #[test]
    fn test_missing_memory_is_fatal() {
        let wat = r#"(module (func (export "malloc") (param i32) (result i32) (i32.const 0)))"#;
        let err = CompiledModule::from_wat(engine().inner(), wat).unwrap_err();

        assert!(matches!(err, RuntimeError::InvalidGuest { .. }), "{err}");
    }

    #[test]
    fn test_missing_allocator_is_fatal() {
        let wat = r#"(module (memory (export "memory") 1))"#;
        let err = CompiledModule::from_wat(engine().inner(), wat).unwrap_err();

        assert!(err.to_string().contains("allocator"), "{err}");
    }

    #[test]
    fn test_allocator_with_wrong_signature_is_rejected() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "malloc") (param i64) (result i64) (i64.const 0))
            )
        "#;
        let err = CompiledModule::from_wat(engine().inner(), wat).unwrap_err();

        assert!(matches!(err, RuntimeError::InvalidGuest { .. }));
    }

    #[test]
    fn test_handler_export_name() {
        assert_eq!(handler_export_name(0), "__route_handler_0");
        assert_eq!(handler_export_name(12), "__route_handler_12");
    }
}
