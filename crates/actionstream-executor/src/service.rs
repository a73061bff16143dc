//! Running actions and narrating them as events.
//!
//! Every action emits `start` first and exactly one terminal event last.
//! Emission is best-effort: failures are logged and never retried, and they
//! never change the action's own outcome.

use std::{process::Stdio, sync::Arc, time::Duration};

use actionstream_core::{
    ActionId, Event, EventEmitter, EventKind, InterpreterCellBody, ResultStatus, SandboxId,
    ShellCommandBody, StreamKind,
};
use command_group::AsyncCommandGroup;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::{interpreter::InterpreterPool, serializer::ExecutionSerializer, shell::get_shell_command};

/// Executes shell commands and interpreter cells for any number of sandboxes.
pub struct ExecutionService {
    serializer: ExecutionSerializer,
    interpreters: InterpreterPool,
    emitter: Arc<dyn EventEmitter>,
}

impl ExecutionService {
    #[must_use]
    pub fn new(interpreters: InterpreterPool, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            serializer: ExecutionSerializer::new(),
            interpreters,
            emitter,
        }
    }

    #[must_use]
    pub const fn serializer(&self) -> &ExecutionSerializer {
        &self.serializer
    }

    #[must_use]
    pub const fn interpreters(&self) -> &InterpreterPool {
        &self.interpreters
    }

    async fn emit(&self, sandbox_id: &SandboxId, event: &Event) {
        if let Err(e) = self.emitter.emit(sandbox_id, event).await {
            tracing::warn!(
                %sandbox_id,
                action_id = ?event.action_id,
                event_type = event.type_name(),
                "Failed to emit event: {e}"
            );
        }
    }

    /// Run a shell command in its own process group.
    ///
    /// Not serialized: commands for the same sandbox may run concurrently.
    /// Returns the terminal event that was emitted.
    pub async fn run_shell(
        &self,
        sandbox_id: &SandboxId,
        action_id: &ActionId,
        body: ShellCommandBody,
    ) -> Event {
        let (shell, flag) = get_shell_command();
        let mut cmd = Command::new(&shell);
        cmd.arg(flag)
            .arg(&body.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &body.work_dir {
            cmd.current_dir(dir);
        }
        if let Some(env) = &body.env {
            cmd.envs(env);
        }

        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(%sandbox_id, %action_id, "Failed to spawn shell: {e}");
                self.emit(sandbox_id, &Event::command_start(action_id, &body.command, None))
                    .await;
                let terminal = Event::error(action_id, "failed to spawn command", Some(e.to_string()));
                self.emit(sandbox_id, &terminal).await;
                return terminal;
            }
        };
        tracing::info!(%sandbox_id, %action_id, pid = ?child.id(), "Running shell command");
        self.emit(sandbox_id, &Event::command_start(action_id, &body.command, child.id()))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.inner().stdout.take() {
            tokio::spawn(pump_lines(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            tokio::spawn(pump_lines(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let mut stderr_text = String::new();
        let limit = body.timeout.map(Duration::from_secs);
        let finished = async {
            while let Some((stream, line)) = rx.recv().await {
                if stream == StreamKind::Stderr {
                    stderr_text.push_str(&line);
                }
                self.emit(sandbox_id, &Event::output(action_id, stream, line)).await;
            }
            child.wait().await
        };
        let waited = match limit {
            Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
            None => Some(finished.await),
        };

        let terminal = match waited {
            Some(Ok(status)) => {
                let exit_code = status.code().map_or(-1, i64::from);
                if exit_code == 0 {
                    Event::exited(action_id, 0)
                } else {
                    let stderr_text = stderr_text.trim();
                    Event::new(
                        Some(action_id.clone()),
                        EventKind::Result {
                            status: ResultStatus::Error,
                            exit_code: Some(exit_code),
                            error_name: None,
                            error_value: (!stderr_text.is_empty()).then(|| stderr_text.to_string()),
                            traceback: Vec::new(),
                        },
                    )
                }
            }
            Some(Err(e)) => {
                tracing::error!(%sandbox_id, %action_id, "Failed to wait for command: {e}");
                Event::error(action_id, "failed to wait for command", Some(e.to_string()))
            }
            None => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!("Failed to kill timed out command: {e}");
                }
                let _ = child.wait().await;
                let secs = limit.map_or(0, |l| l.as_secs());
                tracing::warn!(%sandbox_id, %action_id, "Shell command timed out after {secs}s");
                Event::failed(
                    action_id,
                    -1,
                    "TimeoutError",
                    format!("command timed out after {secs}s"),
                    Vec::new(),
                )
            }
        };

        self.emit(sandbox_id, &terminal).await;
        terminal
    }

    /// Run an interpreter cell while holding the sandbox's execution lock.
    ///
    /// Returns the terminal event that was emitted.
    pub async fn run_cell(
        &self,
        sandbox_id: &SandboxId,
        action_id: &ActionId,
        body: InterpreterCellBody,
    ) -> Event {
        self.serializer
            .run_exclusive(sandbox_id, self.run_cell_locked(sandbox_id, action_id, body))
            .await
    }

    async fn run_cell_locked(
        &self,
        sandbox_id: &SandboxId,
        action_id: &ActionId,
        body: InterpreterCellBody,
    ) -> Event {
        tracing::info!(%sandbox_id, %action_id, "Running interpreter cell");
        self.emit(sandbox_id, &Event::cell_start(action_id, &body.code)).await;

        let interpreter = self.interpreters.get(sandbox_id);
        let limit = body.timeout.map(Duration::from_secs);
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, interpreter.run_cell(&body.code))
                .await
                .ok(),
            None => Some(interpreter.run_cell(&body.code).await),
        };

        let terminal = match result {
            Some(Ok(outcome)) => {
                let chunks = [
                    (StreamKind::Stdout, outcome.stdout),
                    (StreamKind::Stderr, outcome.stderr),
                    (StreamKind::Display, outcome.display.unwrap_or_default()),
                ];
                for (stream, text) in chunks {
                    if !text.is_empty() {
                        self.emit(sandbox_id, &Event::output(action_id, stream, text)).await;
                    }
                }
                match outcome.error {
                    None => Event::exited(action_id, 0),
                    Some(error) => {
                        tracing::debug!(%sandbox_id, %action_id, error = %error.name, "Cell raised");
                        Event::failed(action_id, 1, error.name, error.value, error.traceback)
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!(%sandbox_id, %action_id, "Interpreter failure: {e}");
                Event::error(action_id, "interpreter failure", Some(e.to_string()))
            }
            None => {
                interpreter.reset().await;
                let secs = limit.map_or(0, |l| l.as_secs());
                tracing::warn!(%sandbox_id, %action_id, "Cell timed out after {secs}s, interpreter reset");
                Event::failed(
                    action_id,
                    1,
                    "TimeoutError",
                    format!("cell timed out after {secs}s; interpreter state was reset"),
                    Vec::new(),
                )
            }
        };

        self.emit(sandbox_id, &terminal).await;
        terminal
    }
}

/// Forward `reader` line by line, newline included.
async fn pump_lines<R>(reader: R, stream: StreamKind, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Error reading command output: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Instant,
    };

    use actionstream_core::EmitError;
    use async_trait::async_trait;

    use super::*;
    use crate::{
        emitter::ChannelEmitter,
        interpreter::{CellError, CellOutcome, Interpreter, InterpreterError},
    };

    type Intervals = Arc<Mutex<Vec<(String, Instant, Instant)>>>;

    struct ScriptedInterpreter {
        sandbox: String,
        delay: Duration,
        outcome: Result<CellOutcome, ()>,
        intervals: Intervals,
        resets: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Interpreter for ScriptedInterpreter {
        async fn run_cell(&self, _code: &str) -> Result<CellOutcome, InterpreterError> {
            let start = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.intervals
                .lock()
                .unwrap()
                .push((self.sandbox.clone(), start, Instant::now()));
            self.outcome.clone().map_err(|()| InterpreterError::Exited)
        }

        async fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingEmitter;

    #[async_trait]
    impl EventEmitter for FailingEmitter {
        async fn emit(&self, _: &SandboxId, _: &Event) -> Result<(), EmitError> {
            Err(EmitError::Transport("unreachable".into()))
        }
    }

    struct Harness {
        service: Arc<ExecutionService>,
        events: mpsc::UnboundedReceiver<(SandboxId, Event)>,
        intervals: Intervals,
        resets: Arc<AtomicUsize>,
    }

    fn harness(delay: Duration, outcome: Result<CellOutcome, ()>) -> Harness {
        let intervals: Intervals = Arc::default();
        let resets = Arc::new(AtomicUsize::new(0));
        let (factory_intervals, factory_resets) = (Arc::clone(&intervals), Arc::clone(&resets));
        let pool = InterpreterPool::new(Arc::new(move |sandbox: &SandboxId| {
            Arc::new(ScriptedInterpreter {
                sandbox: sandbox.clone(),
                delay,
                outcome: outcome.clone(),
                intervals: Arc::clone(&factory_intervals),
                resets: Arc::clone(&factory_resets),
            }) as Arc<dyn Interpreter>
        }));
        let (emitter, events) = ChannelEmitter::new();
        Harness {
            service: Arc::new(ExecutionService::new(pool, Arc::new(emitter))),
            events,
            intervals,
            resets,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<(SandboxId, Event)>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn shell(command: &str) -> ShellCommandBody {
        ShellCommandBody {
            command: command.to_string(),
            work_dir: None,
            env: None,
            timeout: None,
        }
    }

    fn cell(code: &str) -> InterpreterCellBody {
        InterpreterCellBody {
            code: code.to_string(),
            timeout: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_emits_start_output_result() {
        let mut h = harness(Duration::ZERO, Ok(CellOutcome::default()));
        let id = ActionId::from("a1");
        h.service.run_shell(&"sb".to_string(), &id, shell("echo hi")).await;

        let events = drain(&mut h.events);
        let kinds: Vec<&str> = events.iter().map(Event::type_name).collect();
        assert_eq!(kinds, ["start", "output_chunk", "result"]);
        assert!(matches!(
            &events[1].kind,
            EventKind::OutputChunk { stream: StreamKind::Stdout, data } if data == "hi\n"
        ));
        assert!(matches!(
            events[2].kind,
            EventKind::Result { status: ResultStatus::Ok, exit_code: Some(0), .. }
        ));
        assert!(events.iter().all(|e| e.belongs_to(&id)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_carries_stderr() {
        let mut h = harness(Duration::ZERO, Ok(CellOutcome::default()));
        let id = ActionId::from("a1");
        let terminal = h
            .service
            .run_shell(&"sb".to_string(), &id, shell("echo oops >&2; exit 3"))
            .await;
        match terminal.kind {
            EventKind::Result { status, exit_code, error_value, .. } => {
                assert_eq!(status, ResultStatus::Error);
                assert_eq!(exit_code, Some(3));
                assert_eq!(error_value.as_deref(), Some("oops"));
            }
            other => panic!("unexpected terminal: {other:?}"),
        }
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            EventKind::OutputChunk { stream: StreamKind::Stderr, data } if data == "oops\n"
        )));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_dir_and_env() {
        let mut h = harness(Duration::ZERO, Ok(CellOutcome::default()));
        let body = ShellCommandBody {
            command: "pwd; echo \"$GREETING\"".to_string(),
            work_dir: Some("/".to_string()),
            env: Some([("GREETING".to_string(), "hello".to_string())].into()),
            timeout: None,
        };
        h.service.run_shell(&"sb".to_string(), &ActionId::from("a1"), body).await;
        let output: String = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::OutputChunk { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(output, "/\nhello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_timeout_kills_command() {
        let h = harness(Duration::ZERO, Ok(CellOutcome::default()));
        let body = ShellCommandBody {
            timeout: Some(1),
            ..shell("sleep 30")
        };
        let started = Instant::now();
        let terminal = h.service.run_shell(&"sb".to_string(), &ActionId::from("a1"), body).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            terminal.kind,
            EventKind::Result { ref error_name, exit_code: Some(-1), .. }
                if error_name.as_deref() == Some("TimeoutError")
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_emission_failure_does_not_fail_action() {
        let service = ExecutionService::new(InterpreterPool::python("python3 -u"), Arc::new(FailingEmitter));
        let terminal = service
            .run_shell(&"sb".to_string(), &ActionId::from("a1"), shell("true"))
            .await;
        assert!(matches!(
            terminal.kind,
            EventKind::Result { status: ResultStatus::Ok, .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cells_serialized_per_sandbox() {
        let h = harness(Duration::from_millis(60), Ok(CellOutcome::default()));
        let run = |sandbox: &'static str, id: &'static str| {
            let service = Arc::clone(&h.service);
            tokio::spawn(async move {
                service
                    .run_cell(&sandbox.to_string(), &ActionId::from(id), cell("x += 1"))
                    .await
            })
        };
        let handles = [run("s1", "a1"), run("s1", "a2"), run("s2", "b1")];
        for handle in handles {
            handle.await.unwrap();
        }

        let intervals = h.intervals.lock().unwrap().clone();
        let s1: Vec<_> = intervals.iter().filter(|(s, ..)| s == "s1").collect();
        let s2: Vec<_> = intervals.iter().filter(|(s, ..)| s == "s2").collect();
        assert_eq!(s1.len(), 2);
        let (a, b) = (s1[0], s1[1]);
        assert!(a.2 <= b.1 || b.2 <= a.1, "same-sandbox cells overlapped");
        let other = s2[0];
        let overlaps_any = s1.iter().any(|x| x.1 < other.2 && other.1 < x.2);
        assert!(overlaps_any, "different sandboxes should run concurrently");
    }

    #[tokio::test]
    async fn test_cell_exception_becomes_failed_result() {
        let outcome = CellOutcome {
            stdout: "before\n".into(),
            error: Some(CellError {
                name: "ZeroDivisionError".into(),
                value: "division by zero".into(),
                traceback: vec!["Traceback".into()],
            }),
            ..CellOutcome::default()
        };
        let mut h = harness(Duration::ZERO, Ok(outcome));
        let id = ActionId::from("a1");
        let terminal = h.service.run_cell(&"sb".to_string(), &id, cell("1/0")).await;
        assert!(matches!(
            terminal.kind,
            EventKind::Result { status: ResultStatus::Error, exit_code: Some(1), ref error_name, .. }
                if error_name.as_deref() == Some("ZeroDivisionError")
        ));
        let kinds: Vec<String> = drain(&mut h.events)
            .iter()
            .map(|e| e.type_name().to_string())
            .collect();
        assert_eq!(kinds, ["start", "output_chunk", "result"]);
    }

    #[tokio::test]
    async fn test_cell_display_chunk() {
        let outcome = CellOutcome {
            display: Some("42".into()),
            ..CellOutcome::default()
        };
        let mut h = harness(Duration::ZERO, Ok(outcome));
        h.service.run_cell(&"sb".to_string(), &ActionId::from("a1"), cell("6*7")).await;
        assert!(drain(&mut h.events).iter().any(|e| matches!(
            &e.kind,
            EventKind::OutputChunk { stream: StreamKind::Display, data } if data == "42"
        )));
    }

    #[tokio::test]
    async fn test_interpreter_failure_is_error_event() {
        let h = harness(Duration::ZERO, Err(()));
        let terminal = h.service.run_cell(&"sb".to_string(), &ActionId::from("a1"), cell("1")).await;
        assert!(matches!(terminal.kind, EventKind::Error { .. }));
        assert!(terminal.is_terminal());
    }

    #[tokio::test]
    async fn test_cell_timeout_resets_interpreter() {
        let h = harness(Duration::from_secs(5), Ok(CellOutcome::default()));
        let body = InterpreterCellBody {
            code: "while True: pass".into(),
            timeout: Some(1),
        };
        let terminal = h.service.run_cell(&"sb".to_string(), &ActionId::from("a1"), body).await;
        assert!(matches!(
            terminal.kind,
            EventKind::Result { ref error_name, .. } if error_name.as_deref() == Some("TimeoutError")
        ));
        assert_eq!(h.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_python_zero_division() {
        if which::which("python3").is_err() {
            eprintln!("python3 not on PATH, skipping");
            return;
        }
        let (emitter, _events) = ChannelEmitter::new();
        let service = ExecutionService::new(InterpreterPool::python("python3 -u"), Arc::new(emitter));
        let terminal = service
            .run_cell(&"sb".to_string(), &ActionId::from("a1"), cell("1/0"))
            .await;
        assert!(matches!(
            terminal.kind,
            EventKind::Result { status: ResultStatus::Error, ref error_name, .. }
                if error_name.as_deref() == Some("ZeroDivisionError")
        ));
    }
}
