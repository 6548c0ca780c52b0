//! Allocation tracking capabilities (`memory_runtime` module).
//!
//! The guest has no collector, so it brackets lifetimes explicitly:
//! `mem_scope_push` / `mem_scope_pop` around a region, `mem_retain` to let a
//! value escape its scope and `mem_release` to drop a reference early. Every
//! allocation whose count reaches zero is handed to the guest deallocator.

use guest_runtime_common::RuntimeError;
use guest_runtime_core::GuestState;
use guest_runtime_core::memory::GuestMemory;
use tracing::{trace, warn};
use wasmtime::{Caller, Linker};

use crate::bridge::link_error;

const MODULE: &str = "memory_runtime";

/// Hand `pointers` back to the guest deallocator.
///
/// Without a deallocator export the pointers are only forgotten.
async fn free_all(caller: &mut Caller<'_, GuestState>, pointers: Vec<i32>) {
    if pointers.is_empty() {
        return;
    }

    let guest = match GuestMemory::from_caller(caller) {
        Ok(guest) => guest,
        Err(e) => {
            warn!(error = %e, "Cannot release guest allocations");
            return;
        }
    };

    for ptr in pointers {
        if let Err(e) = guest.deallocate(&mut *caller, ptr).await {
            warn!(ptr, error = %e, "Guest deallocator failed");
        }
    }
}

/// Register the `memory_runtime` capabilities.
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            MODULE,
            "mem_alloc",
            |mut caller: Caller<'_, GuestState>, (size,): (i32,)| {
                Box::new(async move {
                    let Ok(size) = usize::try_from(size) else {
                        warn!(size, "Negative allocation size");
                        return 0;
                    };

                    let allocated = match GuestMemory::from_caller(&mut caller) {
                        Ok(guest) => guest.allocate(&mut caller, size).await,
                        Err(e) => Err(e),
                    };

                    match allocated {
                        Ok(ptr) => {
                            caller.data_mut().scopes.track(ptr);
                            trace!(ptr, size, "Tracked allocation");
                            ptr
                        }
                        Err(e) => {
                            warn!(size, error = %e, "mem_alloc failed");
                            0
                        }
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "mem_alloc", &e))?;

    linker
        .func_wrap(
            MODULE,
            "mem_retain",
            |mut caller: Caller<'_, GuestState>, ptr: i32| {
                if !caller.data_mut().scopes.retain(ptr) {
                    trace!(ptr, "Retain of untracked pointer ignored");
                }
            },
        )
        .map_err(|e| link_error(MODULE, "mem_retain", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "mem_release",
            |mut caller: Caller<'_, GuestState>, (ptr,): (i32,)| {
                Box::new(async move {
                    if caller.data_mut().scopes.release(ptr) {
                        free_all(&mut caller, vec![ptr]).await;
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "mem_release", &e))?;

    linker
        .func_wrap(
            MODULE,
            "mem_scope_push",
            |mut caller: Caller<'_, GuestState>| {
                caller.data_mut().scopes.push_scope();
            },
        )
        .map_err(|e| link_error(MODULE, "mem_scope_push", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "mem_scope_pop",
            |mut caller: Caller<'_, GuestState>, (): ()| {
                Box::new(async move {
                    let released = caller.data_mut().scopes.pop_scope();
                    trace!(count = released.len(), "Scope popped");
                    free_all(&mut caller, released).await;
                })
            },
        )
        .map_err(|e| link_error(MODULE, "mem_scope_pop", &e))?;

    Ok(())
}
