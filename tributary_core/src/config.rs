//! Small helpers for env-driven configuration.
//!
//! Unset or blank variables fall back to the caller's default; values that are
//! present but unparseable are rejected so typos don't silently change limits.

use crate::{Error, Result};
use std::str::FromStr;

/// Non-blank value of `key`, trimmed.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("invalid {key}: {v}"))),
    }
}

pub fn env_parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(env_parse(key)?.unwrap_or(default))
}

/// Replace all but the last four characters of a secret.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}
