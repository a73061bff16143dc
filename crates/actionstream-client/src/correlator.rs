//! Matching streamed events back to the action that produced them.

use std::time::Duration;

use actionstream_core::{ActionId, Event, EventReceiver, Recv};
use tokio::time::Instant;

use crate::error::CorrelationError;

/// Single consumer of an event queue that waits for one action at a time.
///
/// Events for other actions are discarded, not re-delivered.
#[derive(Debug)]
pub struct Correlator {
    receiver: EventReceiver,
    poll_interval: Duration,
}

impl Correlator {
    #[must_use]
    pub fn new(receiver: EventReceiver, poll_interval: Duration) -> Self {
        Self {
            receiver,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Collect events for `action_id` until `is_terminal` accepts one.
    ///
    /// # Errors
    /// - [`CorrelationError::Timeout`] if `timeout` elapses first
    /// - [`CorrelationError::SinkClosed`] if the queue closes first
    ///
    /// Both carry the events collected so far.
    pub async fn await_action<P>(
        &mut self,
        action_id: &ActionId,
        is_terminal: P,
        timeout: Duration,
    ) -> Result<Vec<Event>, CorrelationError>
    where
        P: Fn(&Event) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    %action_id,
                    collected = collected.len(),
                    ?timeout,
                    "Timed out waiting for terminal event"
                );
                return Err(CorrelationError::Timeout {
                    timeout,
                    partial: collected,
                });
            }

            match self.receiver.recv_timeout(remaining.min(self.poll_interval)).await {
                Recv::Event(event) if event.belongs_to(action_id) => {
                    let done = is_terminal(&event);
                    collected.push(event);
                    if done {
                        return Ok(collected);
                    }
                }
                Recv::Event(event) => {
                    tracing::trace!(
                        waiting_for = %action_id,
                        action_id = ?event.action_id,
                        event_type = event.type_name(),
                        "Discarding unrelated event"
                    );
                }
                Recv::Empty => {}
                Recv::Closed => {
                    tracing::warn!(%action_id, "Event sink closed while waiting");
                    return Err(CorrelationError::SinkClosed { partial: collected });
                }
            }
        }
    }

    /// [`await_action`](Self::await_action) with the standard terminal predicate.
    ///
    /// # Errors
    /// See [`await_action`](Self::await_action).
    pub async fn await_terminal(
        &mut self,
        action_id: &ActionId,
        timeout: Duration,
    ) -> Result<Vec<Event>, CorrelationError> {
        self.await_action(action_id, Event::is_terminal, timeout).await
    }

    #[must_use]
    pub fn into_receiver(self) -> EventReceiver {
        self.receiver
    }
}
