//! Shared vocabulary for sandbox actions and their event streams.
//!
//! This crate provides:
//! - `ActionRequest` / `ActionId` - What gets submitted and how it is tracked
//! - `Event` - Canonical typed events
//! - `decode_frame` - Normalization of heterogeneous wire frames
//! - `EventSender` / `EventReceiver` - The single delivery channel and its adapters
//! - `EventEmitter` - Trait for publishing events to stream observers

pub mod action;
pub mod error;
pub mod event;
pub mod normalize;
pub mod sink;
pub mod traits;

pub use action::{
    AcceptedResponse, ActionConstraints, ActionId, ActionKind, ActionRequest, ErrorResponse,
    InterpreterCellBody, SandboxId, ShellCommandBody,
};
pub use error::{EmitError, ProtocolError, SinkClosed};
pub use event::{Event, EventKind, ResultStatus, StreamKind};
pub use normalize::{decode_frame, decode_value};
pub use sink::{Delivery, EventCallback, EventReceiver, EventSender, Recv, attach, event_channel};
pub use traits::EventEmitter;
