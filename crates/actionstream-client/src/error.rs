//! Client-side error taxonomy.

use std::time::Duration;

use actionstream_core::Event;
use thiserror::Error;

/// Errors surfaced to callers of the client.
///
/// Failures of the action itself are not errors: they arrive as data in the
/// terminal event.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend could not be reached.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The backend answered a well-formed request with a non-success status.
    #[error("backend rejected request with status {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("invalid response from backend: {0}")]
    InvalidResponse(String),
    /// A single stream connection attempt failed. Reported to hooks; retried.
    #[error("stream error: {0}")]
    Stream(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("stream is already connected or connecting")]
    AlreadyConnected,
    #[error("timed out after {0:?} waiting for the stream to connect")]
    ConnectTimeout(Duration),
    #[error("connect was cancelled by a disconnect")]
    ConnectCancelled,
    /// Not retried.
    #[error("invalid stream URL: {0}")]
    InvalidStreamUrl(String),
    #[error("event queue unavailable: {0}")]
    QueueUnavailable(&'static str),
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Waiting for an action's terminal event did not succeed.
///
/// Both variants carry the events collected so far.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("no terminal event within {timeout:?} ({} events collected)", .partial.len())]
    Timeout { timeout: Duration, partial: Vec<Event> },
    #[error("event sink closed ({} events collected)", .partial.len())]
    SinkClosed { partial: Vec<Event> },
}

impl CorrelationError {
    #[must_use]
    pub fn partial(&self) -> &[Event] {
        match self {
            Self::Timeout { partial, .. } | Self::SinkClosed { partial } => partial,
        }
    }

    #[must_use]
    pub fn into_partial(self) -> Vec<Event> {
        match self {
            Self::Timeout { partial, .. } | Self::SinkClosed { partial } => partial,
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
