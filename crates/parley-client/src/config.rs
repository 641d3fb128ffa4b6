//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a client can start with zero
//! configuration.

use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_EVENT_BUFFER, DEFAULT_HISTORY_PAGE_SIZE, DEFAULT_REQUEST_TIMEOUT_MS, MAX_FILE_SIZE,
    MAX_HISTORY_PAGE_SIZE, MAX_TEXT_LENGTH,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Messages fetched per history cursor page.
    /// Env: `PARLEY_HISTORY_PAGE_SIZE`
    /// Default: `30`
    pub history_page_size: usize,

    /// Bound on every transport round trip. Expiry is a retriable transport
    /// error.
    /// Env: `PARLEY_REQUEST_TIMEOUT_MS`
    /// Default: `10000`
    pub request_timeout: Duration,

    /// Largest file accepted for a file send, in bytes.
    /// Env: `PARLEY_MAX_FILE_SIZE`
    /// Default: 25 MiB
    pub max_file_size: u64,

    /// Longest text body accepted, in characters.
    /// Env: `PARLEY_MAX_TEXT_LENGTH`
    /// Default: `5000`
    pub max_text_length: usize,

    /// Buffer of each per-channel inbound event subscription.
    /// Env: `PARLEY_EVENT_BUFFER`
    /// Default: `256`
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_file_size: MAX_FILE_SIZE,
            max_text_length: MAX_TEXT_LENGTH,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_HISTORY_PAGE_SIZE") {
            if (1..=MAX_HISTORY_PAGE_SIZE).contains(&n) {
                config.history_page_size = n;
            } else {
                tracing::warn!(value = n, "PARLEY_HISTORY_PAGE_SIZE out of range, using default");
            }
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_REQUEST_TIMEOUT_MS") {
            if ms > 0 {
                config.request_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(n) = parse_var::<u64>(&lookup, "PARLEY_MAX_FILE_SIZE") {
            config.max_file_size = n;
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_MAX_TEXT_LENGTH") {
            config.max_text_length = n;
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_EVENT_BUFFER") {
            config.event_buffer = n.max(1);
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(vars: &[(&str, &str)]) -> ClientConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_vars(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.history_page_size, 30);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config, from_map(&[]));
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("PARLEY_HISTORY_PAGE_SIZE", "50"),
            ("PARLEY_REQUEST_TIMEOUT_MS", "250"),
            ("PARLEY_MAX_TEXT_LENGTH", "10"),
        ]);
        assert_eq!(config.history_page_size, 50);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.max_text_length, 10);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_map(&[
            ("PARLEY_HISTORY_PAGE_SIZE", "0"),
            ("PARLEY_REQUEST_TIMEOUT_MS", "soon"),
        ]);
        assert_eq!(config, ClientConfig::default());
    }
}
