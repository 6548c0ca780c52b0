//! Cryptographic capabilities (`crypto` module).
//!
//! Password hashing uses Argon2id on the blocking pool so a slow hash never
//! stalls other requests. Tokens are compact HS256 JWTs signed with the
//! host's token secret.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use guest_runtime_common::RuntimeError;
use guest_runtime_core::GuestState;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256, Sha512};
use tracing::warn;
use wasmtime::{Caller, Linker};

use crate::bridge::{flag, link_error, text_arg, text_result};

const MODULE: &str = "crypto";

/// Upper bound for `random_bytes`.
pub const MAX_RANDOM_BYTES: usize = 4096;

type HmacSha256 = Hmac<Sha256>;

/// Hash a password into a PHC string.
pub fn hash_password(password: &str) -> Option<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| warn!(error = %e, "Password hashing failed"))
        .ok()
}

/// Check a password against a PHC string; malformed hashes never match.
pub fn verify_password(password: &str, phc: &str) -> bool {
    PasswordHash::new(phc).is_ok_and(|hash| {
        Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok()
    })
}

fn mac(secret: &[u8], signing_input: &str) -> Option<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).ok()?;
    mac.update(signing_input.as_bytes());
    Some(mac)
}

/// Sign `claims` as an HS256 token.
///
/// A positive `ttl_secs` adds an `exp` claim relative to `now_secs`.
/// Returns `None` when `claims` is not a JSON object.
pub fn sign_token(secret: &[u8], claims: &Value, ttl_secs: i64, now_secs: i64) -> Option<String> {
    let mut claims: Map<String, Value> = claims.as_object()?.clone();
    if ttl_secs > 0 {
        claims.insert("exp".into(), json!(now_secs.saturating_add(ttl_secs)));
    }

    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let payload = URL_SAFE_NO_PAD.encode(Value::Object(claims).to_string());
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(mac(secret, &signing_input)?.finalize().into_bytes());

    Some(format!("{signing_input}.{signature}"))
}

/// Verify an HS256 token and return its claims.
///
/// Fails on a bad signature, a different algorithm or an `exp` at or
/// before `now_secs`.
pub fn verify_token(secret: &[u8], token: &str, now_secs: i64) -> Option<Map<String, Value>> {
    let mut parts = token.split('.');
    let (header, payload, signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
    mac(secret, &format!("{header}.{payload}"))?
        .verify_slice(&signature)
        .ok()?;

    let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).ok()?).ok()?;
    if header.get("alg").and_then(Value::as_str) != Some("HS256") {
        return None;
    }

    let claims = match serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()? {
        Value::Object(claims) => claims,
        _ => return None,
    };

    match claims.get("exp").map(Value::as_i64) {
        None => Some(claims),
        Some(Some(exp)) if exp > now_secs => Some(claims),
        Some(_) => None,
    }
}

/// Hex digest of `data`; `None` for an unknown algorithm.
pub fn digest(algorithm: &str, data: &[u8]) -> Option<String> {
    match algorithm.to_ascii_lowercase().as_str() {
        "sha256" | "sha-256" => Some(hex::encode(Sha256::digest(data))),
        "sha512" | "sha-512" => Some(hex::encode(Sha512::digest(data))),
        _ => None,
    }
}

/// `count` random bytes as lowercase hex, capped at [`MAX_RANDOM_BYTES`].
pub fn random_hex(count: usize) -> String {
    let mut bytes = vec![0u8; count.min(MAX_RANDOM_BYTES)];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Register the `crypto` capabilities.
#[allow(clippy::too_many_lines)]
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            MODULE,
            "hash_password",
            |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let password = text_arg(&mut caller, "hash_password", ptr, len);
                    let hashed = tokio::task::spawn_blocking(move || hash_password(&password))
                        .await
                        .ok()
                        .flatten();
                    match hashed {
                        Some(phc) => text_result(&mut caller, "hash_password", &phc).await,
                        None => 0,
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "hash_password", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "verify_password",
            |mut caller: Caller<'_, GuestState>,
             (password_ptr, password_len, hash_ptr, hash_len): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let password = text_arg(&mut caller, "verify_password", password_ptr, password_len);
                    let phc = text_arg(&mut caller, "verify_password", hash_ptr, hash_len);
                    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &phc))
                        .await
                        .unwrap_or(false);
                    flag(valid)
                })
            },
        )
        .map_err(|e| link_error(MODULE, "verify_password", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "sign_token",
            |mut caller: Caller<'_, GuestState>, (ptr, len, ttl_secs): (i32, i32, i64)| {
                Box::new(async move {
                    let claims = text_arg(&mut caller, "sign_token", ptr, len);
                    let token = serde_json::from_str::<Value>(&claims).ok().and_then(|claims| {
                        let secret = &caller.data().services().settings().token_secret;
                        sign_token(secret, &claims, ttl_secs, now_secs())
                    });
                    match token {
                        Some(token) => text_result(&mut caller, "sign_token", &token).await,
                        None => {
                            warn!("sign_token: claims must be a JSON object");
                            0
                        }
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "sign_token", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "verify_token",
            |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let token = text_arg(&mut caller, "verify_token", ptr, len);
                    let secret = &caller.data().services().settings().token_secret;
                    let claims = verify_token(secret, &token, now_secs())
                        .map(|claims| Value::Object(claims).to_string())
                        .unwrap_or_default();
                    text_result(&mut caller, "verify_token", &claims).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "verify_token", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "random_bytes",
            |mut caller: Caller<'_, GuestState>, (count,): (i32,)| {
                Box::new(async move {
                    let text = random_hex(usize::try_from(count).unwrap_or(0));
                    text_result(&mut caller, "random_bytes", &text).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "random_bytes", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "hash",
            |mut caller: Caller<'_, GuestState>,
             (algorithm_ptr, algorithm_len, data_ptr, data_len): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let algorithm = text_arg(&mut caller, "hash", algorithm_ptr, algorithm_len);
                    let data = text_arg(&mut caller, "hash", data_ptr, data_len);
                    match digest(&algorithm, data.as_bytes()) {
                        Some(hex) => text_result(&mut caller, "hash", &hex).await,
                        None => {
                            warn!(algorithm = %algorithm, "Unsupported hash algorithm");
                            0
                        }
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "hash", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "uuid",
            |mut caller: Caller<'_, GuestState>, (): ()| {
                Box::new(async move {
                    let id = uuid::Uuid::new_v4().to_string();
                    text_result(&mut caller, "uuid", &id).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "uuid", &e))?;

    Ok(())
}
