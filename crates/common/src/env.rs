//! Environment variable helpers shared by the config loaders.

use std::str::FromStr;
use std::time::Duration;

/// Parsed value of `name`, `None` when unset, empty or unparsable.
pub fn var_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

/// Boolean flag: `1|true|on|yes` and `0|false|off|no`, case-insensitive.
pub fn var_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Millisecond duration, e.g. `AGENT_QUEUE_WAIT_MS=250`.
pub fn var_duration_ms(name: &str) -> Option<Duration> {
    var_parse::<u64>(name).map(Duration::from_millis)
}

/// Non-empty string value.
pub fn var_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
