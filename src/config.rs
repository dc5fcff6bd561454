//! Client configuration.
//!
//! Resolution order for each field:
//! 1. Explicit value set on [`ClientConfig`]
//! 2. Environment variable (via [`ClientConfig::from_env`])
//! 3. Built-in default

use std::time::Duration;

use tracing::warn;

/// Default Cortex service endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://localhost:6868";

/// Default request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default connect timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const ENV_ENDPOINT: &str = "CORTEX_ENDPOINT";
pub const ENV_REQUEST_TIMEOUT: &str = "CORTEX_REQUEST_TIMEOUT_SECS";
pub const ENV_CONNECT_TIMEOUT: &str = "CORTEX_CONNECT_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint.
    pub endpoint: String,
    /// Window a blocking call waits for its reply.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `CORTEX_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|v| !v.trim().is_empty()) {
            config.endpoint = endpoint.trim().to_string();
        }
        if let Some(secs) = parse_secs(&lookup, ENV_REQUEST_TIMEOUT) {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_secs(&lookup, ENV_CONNECT_TIMEOUT) {
            config.connect_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => {
            warn!("Ignoring invalid {}={:?} (expected positive seconds)", key, raw);
            None
        }
        Ok(secs) => Some(secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, "wss://localhost:6868");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_ENDPOINT, " ws://127.0.0.1:9000 "),
            (ENV_REQUEST_TIMEOUT, "5"),
            (ENV_CONNECT_TIMEOUT, "nonsense"),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.endpoint, "ws://127.0.0.1:9000");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_timeout_is_ignored() {
        let config = ClientConfig::from_lookup(|key| {
            (key == ENV_REQUEST_TIMEOUT).then(|| "0".to_string())
        });
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
