use std::env;

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Current UTC time as an ISO8601 string with microsecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Reads a boolean-ish environment variable. Unset, empty, `0`, `false` and
/// `no` are false; anything else is true.
pub fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no"
        ),
        Err(_) => false,
    }
}

/// True if the value only contains characters that are safe in blob store
/// keys and URLs.
pub fn is_url_safe(value: &str) -> bool {
    !value.is_empty() &&
        value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
