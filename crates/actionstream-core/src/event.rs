//! Canonical typed events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::action::ActionId;

/// Which output channel a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Rich display data, e.g. the value of a trailing interpreter expression.
    Display,
}

impl StreamKind {
    /// Map a wire stream name; anything unrecognised is treated as stdout.
    #[must_use]
    pub fn from_wire(name: &str) -> Self {
        match name {
            "stderr" => Self::Stderr,
            "display" | "display_data" | "execute_result" | "update_display_data" => {
                Self::Display
            }
            _ => Self::Stdout,
        }
    }
}

/// Outcome classification carried by a result event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
}

impl ResultStatus {
    #[must_use]
    pub const fn from_exit_code(code: i64) -> Self {
        if code == 0 { Self::Ok } else { Self::Error }
    }
}

/// Type-specific part of an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Action accepted and beginning.
    Start {
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Partial output.
    OutputChunk { stream: StreamKind, data: String },
    /// Terminal outcome of the action itself.
    Result {
        status: ResultStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_value: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        traceback: Vec<String>,
    },
    /// Terminal transport or agent-level failure.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// Sandbox-level state notice, usually without an action id.
    State {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    /// A discriminator this build does not know.
    Unknown { original_type: String },
}

/// One immutable, timestamped fact about an action or sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    #[must_use]
    pub fn new(action_id: Option<ActionId>, kind: EventKind) -> Self {
        Self {
            action_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// `start` for a shell command.
    #[must_use]
    pub fn command_start(action_id: &ActionId, command: impl Into<String>, pid: Option<u32>) -> Self {
        Self::new(
            Some(action_id.clone()),
            EventKind::Start {
                command: Some(command.into()),
                code: None,
                pid,
            },
        )
    }

    /// `start` for an interpreter cell.
    #[must_use]
    pub fn cell_start(action_id: &ActionId, code: impl Into<String>) -> Self {
        Self::new(
            Some(action_id.clone()),
            EventKind::Start {
                command: None,
                code: Some(code.into()),
                pid: None,
            },
        )
    }

    #[must_use]
    pub fn output(action_id: &ActionId, stream: StreamKind, data: impl Into<String>) -> Self {
        Self::new(
            Some(action_id.clone()),
            EventKind::OutputChunk {
                stream,
                data: data.into(),
            },
        )
    }

    /// Result whose status follows the exit code.
    #[must_use]
    pub fn exited(action_id: &ActionId, exit_code: i64) -> Self {
        Self::new(
            Some(action_id.clone()),
            EventKind::Result {
                status: ResultStatus::from_exit_code(exit_code),
                exit_code: Some(exit_code),
                error_name: None,
                error_value: None,
                traceback: Vec::new(),
            },
        )
    }

    /// Failed result carrying the error triple.
    #[must_use]
    pub fn failed(
        action_id: &ActionId,
        exit_code: i64,
        error_name: impl Into<String>,
        error_value: impl Into<String>,
        traceback: Vec<String>,
    ) -> Self {
        Self::new(
            Some(action_id.clone()),
            EventKind::Result {
                status: ResultStatus::Error,
                exit_code: Some(exit_code),
                error_name: Some(error_name.into()),
                error_value: Some(error_value.into()),
                traceback,
            },
        )
    }

    #[must_use]
    pub fn error(action_id: &ActionId, message: impl Into<String>, details: Option<String>) -> Self {
        Self::new(
            Some(action_id.clone()),
            EventKind::Error {
                message: message.into(),
                details,
            },
        )
    }

    /// Whether this event ends its action.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Result { .. } | EventKind::Error { .. })
    }

    /// Whether this event belongs to `action_id`.
    #[must_use]
    pub fn belongs_to(&self, action_id: &ActionId) -> bool {
        self.action_id.as_ref() == Some(action_id)
    }

    /// Canonical wire name of this event's type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match &self.kind {
            EventKind::Start { .. } => "start",
            EventKind::OutputChunk { .. } => "output_chunk",
            EventKind::Result { .. } => "result",
            EventKind::Error { .. } => "error",
            EventKind::State { .. } => "state",
            EventKind::Unknown { original_type } => original_type,
        }
    }

    /// Serialize to a single JSON frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
