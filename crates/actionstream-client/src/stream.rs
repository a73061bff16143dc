//! Resilient subscription to a sandbox's event stream.
//!
//! One background task per connection owns the socket. It is the only writer
//! to the event sink and the only writer of the connection state. Drops are
//! retried with [`Backoff`] until a stop is requested; only an unusable stream
//! URL ends the task on its own.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use actionstream_core::{EventSender, SandboxId, decode_frame};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use url::Url;

use crate::{backoff::Backoff, config::ClientConfig, error::ClientError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a connect that timed out waits for its listener to stop.
const CONNECT_ABORT_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    ReconnectWaiting = 3,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::ReconnectWaiting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectWaiting => "reconnect_waiting",
        };
        f.write_str(name)
    }
}

/// Connection notifications. All methods default to no-ops.
///
/// Called from the listener task; keep them short.
pub trait ConnectionHooks: Send + Sync {
    /// Entered `Connected`.
    fn on_connected(&self, _sandbox_id: &SandboxId) {}
    /// Left `Connected` because the stream dropped. Not called for failed
    /// attempts or for a requested disconnect.
    fn on_disconnected(&self, _sandbox_id: &SandboxId) {}
    /// A connection attempt failed.
    fn on_error(&self, _sandbox_id: &SandboxId, _error: &ClientError) {}
}

/// Hooks that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ConnectionHooks for NoHooks {}

struct Shared {
    sandbox_id: SandboxId,
    config: ClientConfig,
    state: AtomicU8,
    transitions: broadcast::Sender<ConnectionState>,
    hooks: Arc<dyn ConnectionHooks>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        if prev != next {
            tracing::debug!(sandbox_id = %self.sandbox_id, %prev, %next, "Connection state changed");
            let _ = self.transitions.send(next);
        }
    }

    /// `Disconnected -> Connecting`, atomically.
    fn claim(&self) -> bool {
        let claimed = self
            .state
            .compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if claimed {
            let _ = self.transitions.send(ConnectionState::Connecting);
        }
        claimed
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<(), ClientError>>,
}

/// Manages the stream subscription for one sandbox.
pub struct StreamConnection {
    shared: Arc<Shared>,
    sink: Mutex<Option<EventSender>>,
    running: Mutex<Option<Running>>,
}

impl StreamConnection {
    #[must_use]
    pub fn new(
        config: ClientConfig,
        sandbox_id: impl Into<SandboxId>,
        sink: EventSender,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                sandbox_id: sandbox_id.into(),
                config,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                transitions,
                hooks,
            }),
            sink: Mutex::new(Some(sink)),
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn sandbox_id(&self) -> &SandboxId {
        &self.shared.sandbox_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Liveness flag.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver for every subsequent state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.transitions.subscribe()
    }

    /// Start the listener and wait for the first successful connection.
    ///
    /// `timeout` defaults to the configured connect timeout. On timeout the
    /// listener is stopped before returning.
    ///
    /// # Errors
    /// - [`ClientError::AlreadyConnected`] if a listener is already running
    /// - [`ClientError::InvalidStreamUrl`] if the stream URL is unusable
    /// - [`ClientError::ConnectTimeout`] if no connection was made in time
    /// - [`ClientError::QueueUnavailable`] after [`close`](Self::close)
    /// - [`ClientError::ConnectCancelled`] if [`disconnect`](Self::disconnect)
    ///   ran while waiting
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let Some(sink) = lock(&self.sink).clone() else {
            return Err(ClientError::QueueUnavailable("connection was closed"));
        };
        if !self.shared.claim() {
            return Err(ClientError::AlreadyConnected);
        }

        let url = match self.shared.config.stream_url(&self.shared.sandbox_id) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(sandbox_id = %self.shared.sandbox_id, "Not connecting: {e}");
                self.shared.hooks.on_error(&self.shared.sandbox_id, &e);
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let stopped = stop_tx.subscribe();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(listen(
            Arc::clone(&self.shared),
            url,
            sink,
            stop_rx,
            ready_tx,
        ));
        // published before waiting so a concurrent disconnect can stop it
        *lock(&self.running) = Some(Running {
            stop: stop_tx,
            handle,
        });

        let timeout = timeout.unwrap_or(self.shared.config.connect_timeout);
        let outcome = tokio::time::timeout(timeout, ready_rx).await;
        if *stopped.borrow() {
            tracing::info!(sandbox_id = %self.shared.sandbox_id, "Connect cancelled by disconnect");
            return Err(ClientError::ConnectCancelled);
        }

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                // listener gave up before ever connecting
                let running = lock(&self.running).take();
                let result = match running {
                    Some(Running { handle, .. }) => handle.await.ok(),
                    None => None,
                };
                self.shared.set_state(ConnectionState::Disconnected);
                match result {
                    Some(Err(e)) => Err(e),
                    _ => Err(ClientError::InvalidStreamUrl(
                        "listener exited before connecting".to_string(),
                    )),
                }
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %self.shared.sandbox_id,
                    ?timeout,
                    "Timed out connecting to stream"
                );
                let running = lock(&self.running).take();
                if let Some(Running { stop, mut handle }) = running {
                    let _ = stop.send(true);
                    if tokio::time::timeout(CONNECT_ABORT_GRACE, &mut handle)
                        .await
                        .is_err()
                    {
                        tracing::warn!("Listener did not stop after connect timeout; aborting it");
                        handle.abort();
                    }
                    self.shared.set_state(ConnectionState::Disconnected);
                }
                Err(ClientError::ConnectTimeout(timeout))
            }
        }
    }

    /// Stop the listener and wait for it, bounded by the join grace.
    ///
    /// Also stops a listener whose [`connect`](Self::connect) is still
    /// waiting. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        let running = lock(&self.running).take();
        let Some(Running { stop, mut handle }) = running else {
            tracing::debug!(sandbox_id = %self.shared.sandbox_id, "Already disconnected");
            return;
        };

        let _ = stop.send(true);
        let grace = self.shared.config.join_grace();
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!("Listener ended with error: {e}"),
            Ok(Err(e)) => tracing::warn!("Listener task failed: {e}"),
            Err(_) => {
                tracing::warn!(?grace, "Listener did not exit within grace period; aborting it");
                handle.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!(sandbox_id = %self.shared.sandbox_id, "Stream disconnected");
    }

    /// Disconnect and release the event sink.
    ///
    /// Consumers see the channel close once the listener has exited. The
    /// connection cannot be reopened.
    pub async fn close(&self) {
        self.disconnect().await;
        lock(&self.sink).take();
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            let _ = running.stop.send(true);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum LoopExit {
    Stopped,
    Dropped(String),
}

async fn listen(
    shared: Arc<Shared>,
    url: Url,
    sink: EventSender,
    mut stop: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
) -> Result<(), ClientError> {
    let config = &shared.config;
    let sandbox_id = &shared.sandbox_id;
    let mut ready = Some(ready);
    let mut backoff = Backoff::new(config.reconnect_delay, config.max_reconnect_delay);

    let result = loop {
        if *stop.borrow() {
            break Ok(());
        }
        shared.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = stop.changed() => break Ok(()),
            attempt = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str())) => attempt,
        };

        match attempt {
            Ok(Ok((socket, _response))) => {
                shared.set_state(ConnectionState::Connected);
                backoff.reset();
                tracing::info!(%sandbox_id, %url, "Stream connected");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
                shared.hooks.on_connected(sandbox_id);

                match receive_loop(&shared, socket, &sink, &mut stop).await {
                    LoopExit::Stopped => break Ok(()),
                    LoopExit::Dropped(reason) => {
                        tracing::warn!(%sandbox_id, %reason, "Stream dropped, will reconnect");
                        shared.set_state(ConnectionState::ReconnectWaiting);
                        shared.hooks.on_disconnected(sandbox_id);
                    }
                }
            }
            Ok(Err(tungstenite::Error::Url(e))) => {
                let error = ClientError::InvalidStreamUrl(format!("{url}: {e}"));
                tracing::error!(%sandbox_id, "Giving up on stream: {error}");
                shared.hooks.on_error(sandbox_id, &error);
                break Err(error);
            }
            Ok(Err(e)) => {
                tracing::warn!(%sandbox_id, "Stream connection attempt failed: {e}");
                shared.set_state(ConnectionState::ReconnectWaiting);
                shared.hooks.on_error(sandbox_id, &ClientError::Stream(e));
            }
            Err(_) => {
                tracing::warn!(%sandbox_id, timeout = ?config.connect_timeout, "Stream connection attempt timed out");
                shared.set_state(ConnectionState::ReconnectWaiting);
            }
        }

        let delay = backoff.next_delay();
        tracing::debug!(%sandbox_id, ?delay, "Waiting before reconnect");
        tokio::select! {
            _ = stop.changed() => break Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
    };

    shared.set_state(ConnectionState::Disconnected);
    result
}

async fn receive_loop(
    shared: &Shared,
    socket: Socket,
    sink: &EventSender,
    stop: &mut watch::Receiver<bool>,
) -> LoopExit {
    let config = &shared.config;
    let (mut write, mut read) = socket.split();
    let mut ping_deadline: Option<Instant> = None;
    let mut consumer_gone = false;

    loop {
        let wait = ping_deadline.map_or(config.recv_timeout, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        let next = tokio::select! {
            _ = stop.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return LoopExit::Stopped;
            }
            next = tokio::time::timeout(wait, read.next()) => next,
        };

        let message = match next {
            Err(_) if ping_deadline.is_some() => {
                return LoopExit::Dropped("liveness ping went unanswered".to_string());
            }
            Err(_) => {
                tracing::trace!(sandbox_id = %shared.sandbox_id, "Stream idle, probing");
                if let Err(e) = write.send(Message::Ping(Bytes::from_static(b"ping"))).await {
                    return LoopExit::Dropped(format!("liveness ping failed: {e}"));
                }
                ping_deadline = Some(Instant::now() + config.ping_timeout);
                continue;
            }
            Ok(None) => return LoopExit::Dropped("stream ended".to_string()),
            Ok(Some(Err(e))) => return LoopExit::Dropped(format!("receive error: {e}")),
            Ok(Some(Ok(message))) => message,
        };
        // any frame proves the peer is alive
        ping_deadline = None;

        let text = match &message {
            Message::Text(text) => text.as_str(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(sandbox_id = %shared.sandbox_id, "Skipping non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(frame) => {
                return LoopExit::Dropped(format!("closed by server: {frame:?}"));
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let event = match decode_frame(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(sandbox_id = %shared.sandbox_id, "Skipping malformed frame: {e}");
                continue;
            }
        };
        tracing::trace!(
            sandbox_id = %shared.sandbox_id,
            action_id = ?event.action_id,
            event_type = event.type_name(),
            "Received event"
        );

        tokio::select! {
            _ = stop.changed() => return LoopExit::Stopped,
            sent = sink.send(event) => {
                if sent.is_err() && !consumer_gone {
                    tracing::warn!(sandbox_id = %shared.sandbox_id, "Event consumer is gone; dropping events");
                    consumer_gone = true;
                }
            }
        }
    }
}
