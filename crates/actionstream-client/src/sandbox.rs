//! One-sandbox client: submission, stream and correlation wired together.

use std::{sync::Arc, time::Duration};

use actionstream_core::{
    ActionConstraints, ActionId, ActionRequest, Delivery, EventReceiver, SandboxId, attach,
};
use tokio::sync::{Mutex, broadcast};

use crate::{
    config::ClientConfig,
    correlator::Correlator,
    error::ClientError,
    result::ActionResult,
    stream::{ConnectionHooks, ConnectionState, StreamConnection},
    submitter::ActionSubmitter,
};

/// Slack added to an action's own timeout when `execute` picks its budget.
const EXECUTE_SLACK: Duration = Duration::from_secs(5);

/// Client for a single sandbox.
///
/// Events from the stream go to the [`Delivery`] chosen at construction.
/// Only queue delivery supports [`collect`](Self::collect) and
/// [`execute`](Self::execute).
pub struct SandboxClient {
    sandbox_id: SandboxId,
    config: ClientConfig,
    submitter: ActionSubmitter,
    stream: StreamConnection,
    correlator: Mutex<Option<Correlator>>,
}

impl SandboxClient {
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        config: ClientConfig,
        sandbox_id: impl Into<SandboxId>,
        delivery: Delivery,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<Self, ClientError> {
        let sandbox_id = sandbox_id.into();
        let submitter = ActionSubmitter::new(config.clone())?;
        let (sink, receiver) = attach(&delivery);
        let correlator = receiver.map(|rx| Correlator::new(rx, config.poll_interval));
        let stream = StreamConnection::new(config.clone(), sandbox_id.clone(), sink, hooks);
        Ok(Self {
            sandbox_id,
            config,
            submitter,
            stream,
            correlator: Mutex::new(correlator),
        })
    }

    #[must_use]
    pub fn sandbox_id(&self) -> &SandboxId {
        &self.sandbox_id
    }

    /// # Errors
    /// See [`StreamConnection::connect`].
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.stream.connect(timeout).await
    }

    pub async fn disconnect(&self) {
        self.stream.disconnect().await;
    }

    /// Disconnect for good and release the event queue.
    pub async fn close(&self) {
        self.stream.close().await;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_connected()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.stream.state()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.stream.subscribe_state()
    }

    /// # Errors
    /// See [`ActionSubmitter::submit`].
    pub async fn submit(&self, request: &ActionRequest) -> Result<ActionId, ClientError> {
        self.submitter.submit(&self.sandbox_id, request).await
    }

    /// Submit a shell command and return its id without waiting.
    ///
    /// # Errors
    /// See [`ActionSubmitter::submit`].
    pub async fn run_shell_command(
        &self,
        command: impl Into<String>,
        constraints: ActionConstraints,
    ) -> Result<ActionId, ClientError> {
        self.submit(&ActionRequest::shell(command).with_constraints(constraints))
            .await
    }

    /// Submit an interpreter cell and return its id without waiting.
    ///
    /// # Errors
    /// See [`ActionSubmitter::submit`].
    pub async fn run_cell(
        &self,
        code: impl Into<String>,
        constraints: ActionConstraints,
    ) -> Result<ActionId, ClientError> {
        self.submit(&ActionRequest::cell(code).with_constraints(constraints))
            .await
    }

    /// Wait for `action_id` to finish and aggregate its events.
    ///
    /// # Errors
    /// - [`ClientError::QueueUnavailable`] without queue delivery
    /// - [`ClientError::Correlation`] on timeout or a closed queue
    pub async fn collect(
        &self,
        action_id: &ActionId,
        timeout: Duration,
    ) -> Result<ActionResult, ClientError> {
        let mut guard = self.correlator.lock().await;
        let correlator = guard.as_mut().ok_or(ClientError::QueueUnavailable(
            "collect requires queue delivery",
        ))?;
        let events = correlator.await_terminal(action_id, timeout).await?;
        Ok(ActionResult::from_events(action_id.clone(), events))
    }

    /// Submit `request`, then wait for and aggregate its events.
    ///
    /// Connects first if the stream is down. Concurrent calls on one client
    /// run one after another. The wait budget is `timeout`, else the action's
    /// own timeout plus a few seconds, else the configured default.
    ///
    /// # Errors
    /// Any error from connecting, submitting or [`collect`](Self::collect).
    pub async fn execute(
        &self,
        request: &ActionRequest,
        timeout: Option<Duration>,
    ) -> Result<ActionResult, ClientError> {
        let mut guard = self.correlator.lock().await;
        let correlator = guard.as_mut().ok_or(ClientError::QueueUnavailable(
            "execute requires queue delivery",
        ))?;

        if self.stream.state() == ConnectionState::Disconnected {
            match self.stream.connect(None).await {
                Ok(()) | Err(ClientError::AlreadyConnected) => {}
                Err(e) => return Err(e),
            }
        }

        let timeout = timeout
            .or_else(|| request.constraints.timeout.map(|t| t + EXECUTE_SLACK))
            .unwrap_or(self.config.default_action_timeout);

        let action_id = self.submitter.submit(&self.sandbox_id, request).await?;
        let events = correlator.await_terminal(&action_id, timeout).await?;
        let result = ActionResult::from_events(action_id, events);
        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            action_id = %result.action_id,
            status = ?result.status,
            "Action finished"
        );
        Ok(result)
    }

    /// Take the event queue for direct consumption.
    ///
    /// Afterwards `collect` and `execute` report the queue as unavailable.
    pub async fn take_receiver(&self) -> Option<EventReceiver> {
        self.correlator
            .lock()
            .await
            .take()
            .map(Correlator::into_receiver)
    }
}
