//! Argument and return marshalling shared by every capability.
//!
//! String arguments arrive as `(ptr, len)` pairs; string results go back as a
//! pointer to a length-prefixed buffer allocated through the guest's own
//! allocator. Marshalling faults never escape a capability call: readers fall
//! back to an empty string and writers to a null pointer, with a warning.

use guest_runtime_common::{MemoryError, RuntimeError};
use guest_runtime_core::GuestState;
use guest_runtime_core::memory::{self, GuestMemory, caller_memory};
use tracing::warn;
use wasmtime::Caller;

/// Read a string argument.
pub(crate) fn read_arg(
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    len: i32,
) -> Result<String, MemoryError> {
    let memory = caller_memory(caller)?;
    memory::read_text(memory.data(&*caller), ptr, len)
}

/// Read a string argument, substituting `""` when it cannot be read.
pub(crate) fn text_arg(
    caller: &mut Caller<'_, GuestState>,
    capability: &str,
    ptr: i32,
    len: i32,
) -> String {
    read_arg(caller, ptr, len).unwrap_or_else(|e| {
        warn!(
            request_id = %caller.data().request_id,
            capability,
            error = %e,
            "Unreadable string argument"
        );
        String::new()
    })
}

/// Copy `text` into a fresh guest buffer and track it in the active scope.
pub(crate) async fn write_result(
    caller: &mut Caller<'_, GuestState>,
    text: &str,
) -> Result<i32, MemoryError> {
    let guest = GuestMemory::from_caller(caller)?;
    let ptr = guest.write_text(&mut *caller, text).await?;
    caller.data_mut().scopes.track(ptr);
    Ok(ptr)
}

/// Return `text` to the guest, or a null pointer when it cannot be written.
pub(crate) async fn text_result(
    caller: &mut Caller<'_, GuestState>,
    capability: &str,
    text: &str,
) -> i32 {
    match write_result(caller, text).await {
        Ok(ptr) => ptr,
        Err(e) => {
            warn!(
                request_id = %caller.data().request_id,
                capability,
                error = %e,
                "Failed to return string to guest"
            );
            0
        }
    }
}

/// Map a failed `func_wrap` into a configuration error.
pub(crate) fn link_error(module: &str, name: &str, error: &wasmtime::Error) -> RuntimeError {
    RuntimeError::invalid_config(format!("Failed to register {module}::{name}: {error}"))
}

/// `1` for true, `0` for false.
pub(crate) fn flag(value: bool) -> i32 {
    i32::from(value)
}
