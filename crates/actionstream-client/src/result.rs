//! Aggregated outcome of one action.

use actionstream_core::{ActionId, Event, EventKind, ResultStatus, StreamKind};

/// Everything a finished action produced, folded into one value.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub action_id: ActionId,
    /// `None` if no terminal event was seen.
    pub status: Option<ResultStatus>,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    /// Rich display chunks, in order.
    pub display: Vec<String>,
    pub error_name: Option<String>,
    pub error_value: Option<String>,
    pub traceback: Vec<String>,
    /// Message of a terminal `error` event.
    pub error_message: Option<String>,
    /// The raw events, in arrival order.
    pub events: Vec<Event>,
}

impl ActionResult {
    #[must_use]
    pub fn from_events(action_id: ActionId, events: Vec<Event>) -> Self {
        let mut result = Self {
            action_id,
            status: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            display: Vec::new(),
            error_name: None,
            error_value: None,
            traceback: Vec::new(),
            error_message: None,
            events: Vec::new(),
        };

        for event in &events {
            match &event.kind {
                EventKind::OutputChunk { stream, data } => match stream {
                    StreamKind::Stdout => result.stdout.push_str(data),
                    StreamKind::Stderr => result.stderr.push_str(data),
                    StreamKind::Display => result.display.push(data.clone()),
                },
                EventKind::Result {
                    status,
                    exit_code,
                    error_name,
                    error_value,
                    traceback,
                } => {
                    result.status = Some(*status);
                    result.exit_code = *exit_code;
                    result.error_name.clone_from(error_name);
                    result.error_value.clone_from(error_value);
                    result.traceback.clone_from(traceback);
                }
                EventKind::Error { message, details } => {
                    result.status = Some(ResultStatus::Error);
                    result.error_message = Some(match details {
                        Some(details) => format!("{message}: {details}"),
                        None => message.clone(),
                    });
                }
                EventKind::Start { .. } | EventKind::State { .. } | EventKind::Unknown { .. } => {}
            }
        }
        result.events = events;
        result
    }

    /// Whether the action finished with status ok.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == Some(ResultStatus::Ok)
    }
}
