//! Environment-driven configuration helpers.
//!
//! Every config struct in the crate has builder-style `with_*` setters and a
//! `from_env()` constructor; the `FERRY_*` variables they read are parsed here.

use std::time::Duration;

/// Read a millisecond duration. Unset, empty or unparsable values yield `None`.
pub fn env_duration_ms(name: &str) -> Option<Duration> {
    env_u64(name).map(Duration::from_millis)
}

pub fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(
                variable = name,
                value = raw,
                "Ignoring unparsable environment variable"
            );
            None
        }
    }
}

pub fn env_usize(name: &str) -> Option<usize> {
    env_u64(name).and_then(|v| usize::try_from(v).ok())
}

/// Number of CPUs available to this process, at least 1.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
