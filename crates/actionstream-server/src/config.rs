//! Server configuration from the environment.

use std::{str::FromStr, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime settings for the server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Interpreter command line, split shell-style.
    pub interpreter: String,
    /// When set, events are POSTed to `{ingest_url}/{sandbox_id}` instead of
    /// going straight to the in-process hub.
    pub ingest_url: Option<String>,
    /// WebSocket keepalive ping period.
    pub ping_interval: Duration,
    /// Per-event timeout for the HTTP emitter.
    pub emit_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5266,
            interpreter: "python3 -u".to_string(),
            ingest_url: None,
            ping_interval: Duration::from_secs(54),
            emit_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Read `ACTIONSTREAM_*` variables over the defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a variable is set but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = lookup("ACTIONSTREAM_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "ACTIONSTREAM_PORT")? {
            config.port = port;
        }
        if let Some(interpreter) = lookup("ACTIONSTREAM_INTERPRETER") {
            config.interpreter = interpreter;
        }
        config.ingest_url = lookup("ACTIONSTREAM_INGEST_URL").filter(|url| !url.trim().is_empty());
        if let Some(secs) = parse::<u64>(&lookup, "ACTIONSTREAM_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse::<u64>(&lookup, "ACTIONSTREAM_EMIT_TIMEOUT_SECS")? {
            config.emit_timeout = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.bind_addr(), "127.0.0.1:5266");
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("ACTIONSTREAM_HOST", "0.0.0.0"),
            ("ACTIONSTREAM_PORT", "0"),
            ("ACTIONSTREAM_INGEST_URL", "http://hub/v1/internal/observations"),
            ("ACTIONSTREAM_PING_INTERVAL_SECS", " 5 "),
        ])
        .unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:0");
        assert_eq!(config.ingest_url.as_deref(), Some("http://hub/v1/internal/observations"));
        assert_eq!(config.ping_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_blank_ingest_url_is_unset() {
        let config = from_pairs(&[("ACTIONSTREAM_INGEST_URL", "  ")]).unwrap();
        assert_eq!(config.ingest_url, None);
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let err = from_pairs(&[("ACTIONSTREAM_PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ACTIONSTREAM_PORT", .. }));
    }
}
