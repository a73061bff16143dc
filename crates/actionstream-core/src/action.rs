//! Actions submitted to a sandbox and their HTTP bodies.

use std::{collections::HashMap, fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sandbox identifier.
pub type SandboxId = String;

/// Backend-assigned action identifier.
///
/// Only the backend mints these; clients treat them as opaque correlation keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Mint a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ActionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ActionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// A cell in the sandbox's persistent interpreter.
    #[serde(rename = "ipython")]
    Interpreter,
    /// A command in a fresh shell process.
    #[serde(rename = "shell")]
    Shell,
}

impl ActionKind {
    /// Path segment of the submission endpoint.
    #[must_use]
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Interpreter => "ipython",
            Self::Shell => "shell",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// Optional limits and environment for one action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionConstraints {
    pub timeout: Option<Duration>,
    /// Ignored by interpreter cells.
    pub working_dir: Option<PathBuf>,
    /// Ignored by interpreter cells.
    pub env: HashMap<String, String>,
}

impl ActionConstraints {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A unit of work, before the backend has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub kind: ActionKind,
    /// Command line or code text.
    pub payload: String,
    pub constraints: ActionConstraints,
}

impl ActionRequest {
    #[must_use]
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Shell,
            payload: command.into(),
            constraints: ActionConstraints::default(),
        }
    }

    #[must_use]
    pub fn cell(code: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Interpreter,
            payload: code.into(),
            constraints: ActionConstraints::default(),
        }
    }

    #[must_use]
    pub fn with_constraints(mut self, constraints: ActionConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// JSON body for the submission endpoint.
    #[must_use]
    pub fn to_body(&self) -> serde_json::Value {
        // whole seconds, never shorter than asked for
        let timeout = self
            .constraints
            .timeout
            .map(|t| (t.as_secs() + u64::from(t.subsec_nanos() > 0)).max(1));
        match self.kind {
            ActionKind::Shell => serde_json::to_value(ShellCommandBody {
                command: self.payload.clone(),
                work_dir: self
                    .constraints
                    .working_dir
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                env: (!self.constraints.env.is_empty()).then(|| self.constraints.env.clone()),
                timeout,
            }),
            ActionKind::Interpreter => serde_json::to_value(InterpreterCellBody {
                code: self.payload.clone(),
                timeout,
            }),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Body of `POST /v1/sandboxes/{id}/shell`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommandBody {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Body of `POST /v1/sandboxes/{id}/ipython`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterCellBody {
    pub code: String,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// `202 Accepted` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub action_id: ActionId,
}

/// Error body returned by the backend for non-success statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_body_omits_empty_constraints() {
        let body = ActionRequest::shell("echo hi").to_body();
        assert_eq!(body, serde_json::json!({ "command": "echo hi" }));
    }

    #[test]
    fn test_shell_body_carries_constraints() {
        let request = ActionRequest::shell("ls").with_constraints(
            ActionConstraints::default()
                .with_timeout(Duration::from_secs(5))
                .with_working_dir("/tmp")
                .with_env("A", "1"),
        );
        let body = request.to_body();
        assert_eq!(body["work_dir"], "/tmp");
        assert_eq!(body["env"]["A"], "1");
        assert_eq!(body["timeout"], 5);
    }

    #[test]
    fn test_cell_body_ignores_shell_only_fields() {
        let request = ActionRequest::cell("x = 1")
            .with_constraints(ActionConstraints::default().with_working_dir("/tmp"));
        assert_eq!(request.to_body(), serde_json::json!({ "code": "x = 1" }));
    }

    #[test]
    fn test_sub_second_timeout_rounds_up() {
        let request = ActionRequest::cell("pass").with_constraints(
            ActionConstraints::default().with_timeout(Duration::from_millis(200)),
        );
        assert_eq!(request.to_body()["timeout"], 1);
    }

    #[test]
    fn test_fractional_timeout_rounds_up() {
        let timeout = |d| {
            ActionRequest::shell("true")
                .with_constraints(ActionConstraints::default().with_timeout(d))
                .to_body()["timeout"]
                .clone()
        };
        assert_eq!(timeout(Duration::from_millis(1500)), 2);
        assert_eq!(timeout(Duration::from_secs(3)), 3);
        assert_eq!(timeout(Duration::from_nanos(3_000_000_001)), 4);
    }

    #[test]
    fn test_action_id_is_transparent() {
        let accepted: AcceptedResponse =
            serde_json::from_str(r#"{"action_id":"abc"}"#).unwrap();
        assert_eq!(accepted.action_id.as_str(), "abc");
        assert_ne!(ActionId::generate(), ActionId::generate());
    }
}
