//! Delivery of decoded events to exactly one consumer.
//!
//! There is one channel type underneath. Queue consumers read from
//! [`EventReceiver`] directly; callback and stream consumers are adapters that
//! drain the same receiver.

use std::{fmt, sync::Arc, time::Duration};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

use crate::{error::SinkClosed, event::Event};

/// Callback invoked once per event, on the adapter's task.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// How a consumer wants events delivered.
#[derive(Clone)]
pub enum Delivery {
    /// Events are queued; `None` means unbounded.
    Queue { capacity: Option<usize> },
    /// Events are handed to a callback.
    Callback(EventCallback),
    /// Nobody is listening. Events are logged and dropped.
    Discard,
}

impl Default for Delivery {
    fn default() -> Self {
        Self::Queue { capacity: None }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue { capacity } => f.debug_struct("Queue").field("capacity", capacity).finish(),
            Self::Callback(_) => f.write_str("Callback"),
            Self::Discard => f.write_str("Discard"),
        }
    }
}

impl Delivery {
    /// Callback delivery from a closure.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }
}

/// Create a channel; `capacity == None` gives an unbounded one.
#[must_use]
pub fn event_channel(capacity: Option<usize>) -> (EventSender, EventReceiver) {
    match capacity {
        Some(cap) => {
            let (tx, rx) = mpsc::channel(cap.max(1));
            (EventSender::Bounded(tx), EventReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (EventSender::Unbounded(tx), EventReceiver::Unbounded(rx))
        }
    }
}

/// Producer half. Cheap to clone.
#[derive(Debug, Clone)]
pub enum EventSender {
    Bounded(mpsc::Sender<Event>),
    Unbounded(mpsc::UnboundedSender<Event>),
}

impl EventSender {
    /// Deliver one event, waiting for room on a bounded channel.
    ///
    /// # Errors
    /// Returns [`SinkClosed`] if the receiver was dropped.
    pub async fn send(&self, event: Event) -> Result<(), SinkClosed> {
        match self {
            Self::Bounded(tx) => tx.send(event).await.map_err(|_| SinkClosed),
            Self::Unbounded(tx) => tx.send(event).map_err(|_| SinkClosed),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Bounded(tx) => tx.is_closed(),
            Self::Unbounded(tx) => tx.is_closed(),
        }
    }
}

/// Result of a bounded wait on the receiver.
#[derive(Debug)]
pub enum Recv {
    Event(Event),
    /// Nothing arrived in time.
    Empty,
    /// Every sender is gone.
    Closed,
}

/// Consumer half.
#[derive(Debug)]
pub enum EventReceiver {
    Bounded(mpsc::Receiver<Event>),
    Unbounded(mpsc::UnboundedReceiver<Event>),
}

impl EventReceiver {
    /// Next event, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Wait at most `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(event)) => Recv::Event(event),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Empty,
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Recv {
        use mpsc::error::TryRecvError;

        let result = match self {
            Self::Bounded(rx) => rx.try_recv(),
            Self::Unbounded(rx) => rx.try_recv(),
        };
        match result {
            Ok(event) => Recv::Event(event),
            Err(TryRecvError::Empty) => Recv::Empty,
            Err(TryRecvError::Disconnected) => Recv::Closed,
        }
    }

    /// Iterator-style consumption.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Event> {
        match self {
            Self::Bounded(rx) => ReceiverStream::new(rx).boxed(),
            Self::Unbounded(rx) => UnboundedReceiverStream::new(rx).boxed(),
        }
    }

    /// Hand every event to `callback` on a spawned task until the channel closes.
    pub fn forward_to(self, callback: EventCallback) -> tokio::task::JoinHandle<()> {
        let stream = self.into_stream();
        tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(event) = stream.next().await {
                callback(event);
            }
        })
    }

    /// Drain and log every event at debug level.
    pub fn discard(self) -> tokio::task::JoinHandle<()> {
        self.forward_to(Arc::new(|event: Event| {
            tracing::debug!(
                action_id = ?event.action_id,
                event_type = event.type_name(),
                "Discarding event: no consumer configured"
            );
        }))
    }
}

/// Wire `delivery` to a fresh channel.
///
/// Returns the sender for the producer plus the receiver when the consumer
/// asked for a queue. Callback and discard consumers are attached on spawned
/// tasks, so this must run inside a tokio runtime.
#[must_use]
pub fn attach(delivery: &Delivery) -> (EventSender, Option<EventReceiver>) {
    match delivery {
        Delivery::Queue { capacity } => {
            let (tx, rx) = event_channel(*capacity);
            (tx, Some(rx))
        }
        Delivery::Callback(callback) => {
            let (tx, rx) = event_channel(None);
            rx.forward_to(Arc::clone(callback));
            (tx, None)
        }
        Delivery::Discard => {
            tracing::warn!("No event queue or callback configured; events will only be logged");
            let (tx, rx) = event_channel(None);
            rx.discard();
            (tx, None)
        }
    }
}
