//! Seams between execution and delivery.

use async_trait::async_trait;

use crate::{action::SandboxId, error::EmitError, event::Event};

/// Publishes events for a sandbox to whoever is watching its stream.
///
/// Callers treat emission as best-effort: a failure is logged by the caller
/// and never changes the outcome of the action being narrated.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Publish one event.
    ///
    /// # Errors
    /// Returns [`EmitError`] if the event could not be handed off.
    async fn emit(&self, sandbox_id: &SandboxId, event: &Event) -> Result<(), EmitError>;
}
