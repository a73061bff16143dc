//! Event emitters used by the execution service.

use std::time::Duration;

use actionstream_core::{EmitError, Event, EventEmitter, SandboxId};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Default per-call timeout for [`HttpEmitter`].
pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes each event to an HTTP ingest endpoint.
///
/// Events for sandbox `S` are POSTed to `{ingest_base}/S`.
#[derive(Debug, Clone)]
pub struct HttpEmitter {
    client: reqwest::Client,
    ingest_base: String,
}

impl HttpEmitter {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(ingest_base: impl Into<String>, timeout: Duration) -> Result<Self, EmitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmitError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            ingest_base: ingest_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, sandbox_id: &SandboxId) -> String {
        format!("{}/{sandbox_id}", self.ingest_base)
    }
}

#[async_trait]
impl EventEmitter for HttpEmitter {
    async fn emit(&self, sandbox_id: &SandboxId, event: &Event) -> Result<(), EmitError> {
        let response = self
            .client
            .post(self.url(sandbox_id))
            .json(event)
            .send()
            .await
            .map_err(|e| EmitError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EmitError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Forwards events into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<(SandboxId, Event)>,
}

impl ChannelEmitter {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SandboxId, Event)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventEmitter for ChannelEmitter {
    async fn emit(&self, sandbox_id: &SandboxId, event: &Event) -> Result<(), EmitError> {
        self.tx
            .send((sandbox_id.clone(), event.clone()))
            .map_err(|_| EmitError::Closed)
    }
}
