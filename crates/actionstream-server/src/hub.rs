//! Per-sandbox fan-out of event frames to stream subscribers.

use std::sync::Arc;

use actionstream_core::{EmitError, Event, EventEmitter, SandboxId};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Frames a slow subscriber may fall behind before it starts skipping.
pub const CHANNEL_CAPACITY: usize = 256;

/// Broadcast channels keyed by sandbox, created on first use.
///
/// Frames published with no subscriber are dropped.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    channels: Arc<DashMap<SandboxId, broadcast::Sender<Arc<str>>>>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, sandbox_id: &SandboxId) -> broadcast::Sender<Arc<str>> {
        self.channels
            .entry(sandbox_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    #[must_use]
    pub fn subscribe(&self, sandbox_id: &SandboxId) -> broadcast::Receiver<Arc<str>> {
        self.sender(sandbox_id).subscribe()
    }

    /// Send one frame to every current subscriber of `sandbox_id`.
    ///
    /// Returns how many subscribers it reached.
    pub fn publish(&self, sandbox_id: &SandboxId, frame: impl Into<Arc<str>>) -> usize {
        if let Ok(reached) = self.sender(sandbox_id).send(frame.into()) {
            reached
        } else {
            tracing::trace!(%sandbox_id, "No stream subscribers; frame dropped");
            0
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, sandbox_id: &SandboxId) -> usize {
        self.channels
            .get(sandbox_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}

#[async_trait]
impl EventEmitter for EventHub {
    async fn emit(&self, sandbox_id: &SandboxId, event: &Event) -> Result<(), EmitError> {
        let frame = event.to_frame()?;
        self.publish(sandbox_id, frame);
        Ok(())
    }
}
