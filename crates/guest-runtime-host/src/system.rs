//! Environment and clock capabilities in the `env` module.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use guest_runtime_common::RuntimeError;
use guest_runtime_core::GuestState;
use wasmtime::{Caller, Linker};

use crate::bridge::{link_error, text_arg, text_result};

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as RFC 3339 with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format `ms` with a strftime pattern.
///
/// An empty pattern gives RFC 3339. Returns `None` for an invalid pattern
/// or an out-of-range timestamp.
pub fn format_time(ms: i64, pattern: &str) -> Option<String> {
    let time = DateTime::<Utc>::from_timestamp_millis(ms)?;
    if pattern.is_empty() {
        return Some(time.to_rfc3339_opts(SecondsFormat::Millis, true));
    }

    let items = StrftimeItems::new(pattern);
    if items.clone().any(|item| matches!(item, Item::Error)) {
        return None;
    }

    Some(time.format_with_items(items).to_string())
}

/// Register `env_get`, `time_now`, `time_iso` and `time_format`.
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            "env",
            "env_get",
            |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let name = text_arg(&mut caller, "env_get", ptr, len);
                    let value = if name.is_empty() {
                        String::new()
                    } else {
                        std::env::var(&name).unwrap_or_default()
                    };
                    text_result(&mut caller, "env_get", &value).await
                })
            },
        )
        .map_err(|e| link_error("env", "env_get", &e))?;

    linker
        .func_wrap("env", "time_now", now_ms)
        .map_err(|e| link_error("env", "time_now", &e))?;

    linker
        .func_wrap_async(
            "env",
            "time_iso",
            |mut caller: Caller<'_, GuestState>, (): ()| {
                Box::new(async move { text_result(&mut caller, "time_iso", &now_iso()).await })
            },
        )
        .map_err(|e| link_error("env", "time_iso", &e))?;

    linker
        .func_wrap_async(
            "env",
            "time_format",
            |mut caller: Caller<'_, GuestState>, (ms, ptr, len): (i64, i32, i32)| {
                Box::new(async move {
                    let pattern = text_arg(&mut caller, "time_format", ptr, len);
                    let text = format_time(ms, &pattern).unwrap_or_default();
                    text_result(&mut caller, "time_format", &text).await
                })
            },
        )
        .map_err(|e| link_error("env", "time_format", &e))?;

    Ok(())
}
