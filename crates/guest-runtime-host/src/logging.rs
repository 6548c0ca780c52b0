//! Console output capabilities (`env::print`, `env::println`, `env::log`).
//!
//! Guest output is kept on the instance's [`GuestState`] for the lifetime of
//! the request and re-emitted through `tracing` with `guest_log = true`.

use guest_runtime_common::RuntimeError;
use guest_runtime_core::{GuestState, LogLevel};
use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Linker};

use crate::bridge::{link_error, text_arg};

/// Host side of guest console output.
pub struct LoggingHost;

impl LoggingHost {
    /// Record `message` on the instance and emit it.
    pub fn log(state: &mut GuestState, level: LogLevel, message: String) {
        let request_id = state.request_id.as_str();
        match level {
            LogLevel::Debug => debug!(request_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(request_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(request_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(request_id, guest_log = true, "{}", message),
        }

        state.log(level, message);
    }
}

/// Register `env::print`, `env::println` and `env::log`.
///
/// `print` and `println` log at info level; a trailing newline is dropped
/// so both produce the same entry.
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    for name in ["print", "println"] {
        linker
            .func_wrap(
                "env",
                name,
                move |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
                    let text = text_arg(&mut caller, name, ptr, len);
                    let message = text.strip_suffix('\n').unwrap_or(&text).to_string();
                    LoggingHost::log(caller.data_mut(), LogLevel::Info, message);
                },
            )
            .map_err(|e| link_error("env", name, &e))?;
    }

    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, GuestState>, level: i32, ptr: i32, len: i32| {
                let message = text_arg(&mut caller, "log", ptr, len);
                LoggingHost::log(caller.data_mut(), LogLevel::from_guest(level), message);
            },
        )
        .map_err(|e| link_error("env", "log", &e))?;

    Ok(())
}
