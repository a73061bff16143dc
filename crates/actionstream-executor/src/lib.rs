//! Backend execution of sandbox actions.
//!
//! This crate provides:
//! - `ExecutionService` - Runs shell commands and interpreter cells, emitting events
//! - `ExecutionSerializer` - One lock per sandbox around interpreter execution
//! - `Interpreter` / `PythonInterpreter` - Stateful interpreters kept per sandbox
//! - `HttpEmitter` / `ChannelEmitter` - Best-effort event delivery

pub mod command;
pub mod emitter;
pub mod interpreter;
pub mod serializer;
pub mod service;
pub mod shell;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use emitter::{ChannelEmitter, DEFAULT_EMIT_TIMEOUT, HttpEmitter};
pub use interpreter::{
    CellError, CellOutcome, Interpreter, InterpreterError, InterpreterFactory, InterpreterPool,
    PythonInterpreter,
};
pub use serializer::ExecutionSerializer;
pub use service::ExecutionService;
pub use shell::{get_shell_command, resolve_executable_path};
