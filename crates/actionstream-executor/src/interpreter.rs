//! Stateful interpreters, one per sandbox.
//!
//! [`PythonInterpreter`] keeps a single `python3` child alive and talks to it
//! over stdin/stdout, one JSON request line and one JSON response line per
//! cell. The child captures stdout and stderr of user code separately, down to
//! the file descriptors, so output from subprocesses lands in the buffers and
//! never on the request channel. The response carries both buffers plus the
//! exception, if any.

use std::{process::Stdio, sync::Arc};

use actionstream_core::SandboxId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};

use crate::command::{CommandBuildError, CommandBuilder};

const DRIVER: &str = include_str!("driver.py");

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("Command build error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Interpreter exited")]
    Exited,
}

/// Exception raised by a cell.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CellError {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Everything a cell produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CellOutcome {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Representation of a trailing expression's value.
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub error: Option<CellError>,
}

/// An interpreter with state that persists across cells.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Execute one cell to completion.
    ///
    /// An exception raised by the cell is an `Ok` outcome with `error` set;
    /// `Err` means the interpreter itself is broken.
    ///
    /// # Errors
    /// Returns [`InterpreterError`] if the interpreter cannot be started or
    /// stops responding.
    async fn run_cell(&self, code: &str) -> Result<CellOutcome, InterpreterError>;

    /// Discard all state. The next cell starts fresh.
    async fn reset(&self);
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    async fn exchange(&mut self, code: &str) -> Result<CellOutcome, InterpreterError> {
        let request = serde_json::to_string(&serde_json::json!({ "code": code }))?;
        self.stdin.write_all(request.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let mut line = String::new();
        if self.stdout.read_line(&mut line).await? == 0 {
            return Err(InterpreterError::Exited);
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Persistent `python3` child process.
pub struct PythonInterpreter {
    command: CommandBuilder,
    process: Mutex<Option<Process>>,
}

impl PythonInterpreter {
    /// `base` is the interpreter command line, e.g. `"python3 -u"`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            command: CommandBuilder::new(base),
            process: Mutex::new(None),
        }
    }

    async fn spawn(&self) -> Result<Process, InterpreterError> {
        let (program, args) = self
            .command
            .clone()
            .extend_params(["-c", DRIVER])
            .build()?
            .into_resolved()
            .await?;

        let mut child = Command::new(&program)
            .args(&args)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(InterpreterError::Spawn)?;

        let stdin = child.stdin.take().ok_or(InterpreterError::Exited)?;
        let stdout = child.stdout.take().ok_or(InterpreterError::Exited)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "interpreter", "{line}");
                }
            });
        }

        tracing::info!(pid = ?child.id(), program = %program.display(), "Started interpreter");
        Ok(Process {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

#[async_trait]
impl Interpreter for PythonInterpreter {
    async fn run_cell(&self, code: &str) -> Result<CellOutcome, InterpreterError> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn().await?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(InterpreterError::Exited);
        };

        match process.exchange(code).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!("Interpreter failed, its state is lost: {e}");
                *guard = None;
                Err(e)
            }
        }
    }

    async fn reset(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(e) = process.child.start_kill() {
                tracing::debug!("Failed to kill interpreter: {e}");
            }
        }
    }
}

/// Builds a fresh interpreter for a sandbox.
pub type InterpreterFactory = Arc<dyn Fn(&SandboxId) -> Arc<dyn Interpreter> + Send + Sync>;

/// One interpreter per sandbox, created on first use.
pub struct InterpreterPool {
    interpreters: DashMap<SandboxId, Arc<dyn Interpreter>>,
    factory: InterpreterFactory,
}

impl InterpreterPool {
    #[must_use]
    pub fn new(factory: InterpreterFactory) -> Self {
        Self {
            interpreters: DashMap::new(),
            factory,
        }
    }

    /// Pool of [`PythonInterpreter`]s launched with `base`.
    #[must_use]
    pub fn python(base: impl Into<String>) -> Self {
        let base = base.into();
        Self::new(Arc::new(move |_: &SandboxId| {
            Arc::new(PythonInterpreter::new(base.clone())) as Arc<dyn Interpreter>
        }))
    }

    /// The sandbox's interpreter, creating it if needed.
    #[must_use]
    pub fn get(&self, sandbox_id: &SandboxId) -> Arc<dyn Interpreter> {
        Arc::clone(
            self.interpreters
                .entry(sandbox_id.clone())
                .or_insert_with(|| (self.factory)(sandbox_id))
                .value(),
        )
    }

    /// Drop the sandbox's interpreter and its state.
    pub async fn remove(&self, sandbox_id: &SandboxId) -> bool {
        let Some((_, interpreter)) = self.interpreters.remove(sandbox_id) else {
            return false;
        };
        interpreter.reset().await;
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interpreters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interpreters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        if which::which("python3").is_ok() {
            return true;
        }
        eprintln!("python3 not on PATH, skipping");
        false
    }

    #[tokio::test]
    async fn test_state_persists_between_cells() {
        if !python_available() {
            return;
        }
        let interpreter = PythonInterpreter::new("python3 -u");
        let first = interpreter.run_cell("x = 20\nprint('set')").await.unwrap();
        assert_eq!(first.stdout, "set\n");
        let second = interpreter.run_cell("x * 2 + 2").await.unwrap();
        assert_eq!(second.display.as_deref(), Some("42"));
        assert!(second.error.is_none());
    }

    #[tokio::test]
    async fn test_exception_is_reported_as_data() {
        if !python_available() {
            return;
        }
        let interpreter = PythonInterpreter::new("python3 -u");
        let outcome = interpreter.run_cell("1/0").await.unwrap();
        let error = outcome.error.unwrap();
        assert_eq!(error.name, "ZeroDivisionError");
        assert_eq!(error.value, "division by zero");
        assert!(error.traceback.iter().any(|l| l.contains("ZeroDivisionError")));
    }

    #[tokio::test]
    async fn test_streams_are_captured_separately() {
        if !python_available() {
            return;
        }
        let interpreter = PythonInterpreter::new("python3 -u");
        let outcome = interpreter
            .run_cell("import sys\nprint('out')\nprint('err', file=sys.stderr)")
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_fd_level_output_is_captured_and_state_survives() {
        if !python_available() {
            return;
        }
        let interpreter = PythonInterpreter::new("python3 -u");
        interpreter.run_cell("x = 41").await.unwrap();

        let outcome = interpreter
            .run_cell("import os, sys\nos.system('echo from-child')\nos.system('echo oops >&2')\nprint('raw', file=sys.__stdout__)")
            .await
            .unwrap();
        assert!(outcome.error.is_none());
        assert!(outcome.stdout.contains("from-child\n"));
        assert!(outcome.stdout.contains("raw\n"));
        assert_eq!(outcome.stderr, "oops\n");

        let after = interpreter.run_cell("x + 1").await.unwrap();
        assert_eq!(after.display.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_child_process_cannot_read_requests() {
        if !python_available() {
            return;
        }
        let interpreter = PythonInterpreter::new("python3 -u");
        let outcome = interpreter
            .run_cell("import subprocess\nsubprocess.run(['cat'])\nz = 5")
            .await
            .unwrap();
        assert!(outcome.error.is_none());
        let next = interpreter.run_cell("z").await.unwrap();
        assert_eq!(next.display.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_traceback_starts_at_the_cell() {
        if !python_available() {
            return;
        }
        let interpreter = PythonInterpreter::new("python3 -u");
        let error = interpreter.run_cell("def f():\n    1/0\nf()").await.unwrap().error.unwrap();
        let frames = error.traceback.concat();
        assert!(frames.contains("<cell>"));
        assert!(!frames.contains("in _run"));
    }

    #[tokio::test]
    async fn test_reset_discards_state() {
        if !python_available() {
            return;
        }
        let interpreter = PythonInterpreter::new("python3 -u");
        interpreter.run_cell("y = 1").await.unwrap();
        interpreter.reset().await;
        let outcome = interpreter.run_cell("y").await.unwrap();
        assert_eq!(outcome.error.unwrap().name, "NameError");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error() {
        let interpreter = PythonInterpreter::new("no-such-python-9913");
        assert!(matches!(
            interpreter.run_cell("1").await,
            Err(InterpreterError::Command(CommandBuildError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_pool_reuses_per_sandbox() {
        let pool = InterpreterPool::python("python3 -u");
        let a = pool.get(&"s1".to_string());
        let b = pool.get(&"s1".to_string());
        let _c = pool.get(&"s2".to_string());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
        assert!(pool.remove(&"s1".to_string()).await);
        assert!(!pool.remove(&"s1".to_string()).await);
    }
}
