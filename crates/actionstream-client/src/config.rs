//! Client configuration.

use std::time::Duration;

use actionstream_core::{ActionKind, SandboxId};
use url::Url;

use crate::error::ClientError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5266";

/// Endpoints and timing for one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend root, e.g. `http://localhost:5266`.
    pub base_url: String,
    /// Per-request timeout for action submission.
    pub api_timeout: Duration,
    /// Default budget for [`StreamConnection::connect`](crate::StreamConnection::connect),
    /// also applied to each individual connection attempt.
    pub connect_timeout: Duration,
    /// Idle time on the stream before a liveness ping is sent.
    pub recv_timeout: Duration,
    /// How long a liveness ping may go unanswered.
    pub ping_timeout: Duration,
    /// Backoff floor.
    pub reconnect_delay: Duration,
    /// Backoff ceiling.
    pub max_reconnect_delay: Duration,
    /// Bound on waiting for the listener to exit on disconnect.
    /// Defaults to `recv_timeout + 2s`.
    pub join_grace: Option<Duration>,
    /// Correlator poll interval.
    pub poll_interval: Duration,
    /// Budget for `execute` when neither the call nor the action names one.
    pub default_action_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            join_grace: None,
            poll_interval: Duration::from_millis(500),
            default_action_timeout: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, floor: Duration, max: Duration) -> Self {
        self.reconnect_delay = floor;
        self.max_reconnect_delay = max;
        self
    }

    #[must_use]
    pub fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = Some(grace);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_default_action_timeout(mut self, timeout: Duration) -> Self {
        self.default_action_timeout = timeout;
        self
    }

    #[must_use]
    pub fn join_grace(&self) -> Duration {
        self.join_grace
            .unwrap_or_else(|| self.recv_timeout + Duration::from_secs(2))
    }

    /// `{base}/v1`.
    #[must_use]
    pub fn api_url(&self) -> String {
        format!("{}/v1", self.base_url.trim_end_matches('/'))
    }

    /// Submission endpoint for `kind` in `sandbox_id`.
    #[must_use]
    pub fn action_url(&self, sandbox_id: &SandboxId, kind: ActionKind) -> String {
        format!("{}/sandboxes/{sandbox_id}/{}", self.api_url(), kind.endpoint())
    }

    /// WebSocket stream endpoint for `sandbox_id`.
    ///
    /// `http` maps to `ws` and `https` to `wss`.
    ///
    /// # Errors
    /// Returns [`ClientError::InvalidStreamUrl`] if the base URL does not parse
    /// or uses another scheme.
    pub fn stream_url(&self, sandbox_id: &SandboxId) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::InvalidStreamUrl(format!("{}: {e}", self.base_url)))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ClientError::InvalidStreamUrl(format!(
                    "unsupported scheme `{other}` in {}",
                    self.base_url
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::InvalidStreamUrl(self.base_url.clone()))?;
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/v1/sandboxes/{sandbox_id}/stream"));
        url.set_query(None);
        Ok(url)
    }
}
