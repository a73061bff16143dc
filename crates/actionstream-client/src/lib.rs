//! Client side of the action/event protocol.
//!
//! This crate provides:
//! - `ActionSubmitter` - Fire-and-accept submission over HTTP
//! - `StreamConnection` - Reconnecting WebSocket subscription feeding an event sink
//! - `Correlator` - Waits for one action's terminal event
//! - `SandboxClient` - All of the above for one sandbox

pub mod backoff;
pub mod config;
pub mod correlator;
pub mod error;
pub mod result;
pub mod sandbox;
pub mod stream;
pub mod submitter;

pub use backoff::Backoff;
pub use config::{ClientConfig, DEFAULT_BASE_URL};
pub use correlator::Correlator;
pub use error::{ClientError, CorrelationError};
pub use result::ActionResult;
pub use sandbox::SandboxClient;
pub use stream::{ConnectionHooks, ConnectionState, NoHooks, StreamConnection};
pub use submitter::ActionSubmitter;
