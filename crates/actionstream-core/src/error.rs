//! Errors shared by both ends of the event stream.

use thiserror::Error;

/// A frame that could not be turned into an event.
///
/// Recovered where it happens: the frame is logged and skipped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("field `{field}` has the wrong type")]
    BadField { field: &'static str },
}

/// Delivering an event to its observers failed.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("ingest endpoint returned {status}")]
    Status { status: u16 },
    #[error("event channel closed")]
    Closed,
}

/// The consuming side of an event channel is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event sink closed")]
pub struct SinkClosed;
