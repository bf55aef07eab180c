//! Configuration management for the oracle coordinator

use std::env;
use std::str::FromStr;
use std::time::Duration;

pub mod coordinator;
pub mod node;

pub use coordinator::CoordinatorConfig;
pub use node::NodeConfig;

/// Read `key` and parse it, falling back to `default` when the variable is
/// missing or unparsable.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

pub(crate) fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Non-empty trimmed value of `key`
pub(crate) fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Comma-separated list, empty entries dropped
pub(crate) fn env_list(key: &str) -> Vec<String> {
    env_string(key)
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
