//! Value conversion capabilities in the `env` module.

use guest_runtime_common::RuntimeError;
use guest_runtime_core::GuestState;
use wasmtime::{Caller, Linker};

use crate::bridge::{link_error, text_arg, text_result};

/// Parse an integer the way guest code expects: surrounding whitespace is
/// ignored, a decimal is truncated toward zero and anything else is `0`.
pub fn parse_int(text: &str) -> i64 {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return value;
    }

    match text.parse::<f64>() {
        #[allow(clippy::cast_possible_truncation)]
        Ok(value) if value.is_finite() => value.trunc() as i64,
        _ => 0,
    }
}

/// Parse a float; unparseable input is `0.0`.
pub fn parse_float(text: &str) -> f64 {
    text.trim().parse().unwrap_or(0.0)
}

/// Render a float without a trailing `.0` for integral values.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        value.to_string()
    }
}

/// Register the conversion capabilities.
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            "env",
            "int_to_string",
            |mut caller: Caller<'_, GuestState>, (value,): (i64,)| {
                Box::new(async move {
                    text_result(&mut caller, "int_to_string", &value.to_string()).await
                })
            },
        )
        .map_err(|e| link_error("env", "int_to_string", &e))?;

    linker
        .func_wrap_async(
            "env",
            "float_to_string",
            |mut caller: Caller<'_, GuestState>, (value,): (f64,)| {
                Box::new(async move {
                    text_result(&mut caller, "float_to_string", &format_float(value)).await
                })
            },
        )
        .map_err(|e| link_error("env", "float_to_string", &e))?;

    linker
        .func_wrap(
            "env",
            "string_to_int",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
                parse_int(&text_arg(&mut caller, "string_to_int", ptr, len))
            },
        )
        .map_err(|e| link_error("env", "string_to_int", &e))?;

    linker
        .func_wrap(
            "env",
            "string_to_float",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
                parse_float(&text_arg(&mut caller, "string_to_float", ptr, len))
            },
        )
        .map_err(|e| link_error("env", "string_to_float", &e))?;

    let transforms: [(&'static str, fn(&str) -> String); 3] = [
        ("string_to_upper", str::to_uppercase),
        ("string_to_lower", str::to_lowercase),
        ("string_trim", |s| s.trim().to_string()),
    ];
    for (name, transform) in transforms {
        linker
            .func_wrap_async(
                "env",
                name,
                move |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                    Box::new(async move {
                        let text = transform(&text_arg(&mut caller, name, ptr, len));
                        text_result(&mut caller, name, &text).await
                    })
                },
            )
            .map_err(|e| link_error("env", name, &e))?;
    }

    linker
        .func_wrap_async(
            "env",
            "string_concat",
            |mut caller: Caller<'_, GuestState>, (p1, l1, p2, l2): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let mut text = text_arg(&mut caller, "string_concat", p1, l1);
                    text.push_str(&text_arg(&mut caller, "string_concat", p2, l2));
                    text_result(&mut caller, "string_concat", &text).await
                })
            },
        )
        .map_err(|e| link_error("env", "string_concat", &e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("42"), 42);
        assert_eq!(parse_int("  -7 \n"), -7);
        assert_eq!(parse_int("3.9"), 3);
        assert_eq!(parse_int("-3.9"), -3);
        assert_eq!(parse_int("abc"), 0);
        assert_eq!(parse_int(""), 0);
    }

    #[test]
    fn test_parse_float() {
        assert!((parse_float(" 2.5 ") - 2.5).abs() < f64::EPSILON);
        assert!(parse_float("nope").abs() < f64::EPSILON);
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(3.0), "3");
        assert_eq!(format_float(1.5), "1.5");
        assert_eq!(format_float(f64::INFINITY), "Infinity");
        assert_eq!(format_float(f64::NAN), "NaN");
    }
}
