//! Runtime surface for sandbox actions.
//!
//! This crate provides:
//! - `router` - Submission, stream, ingest and health routes
//! - `EventHub` - Per-sandbox fan-out of event frames
//! - `ServerConfig` - Settings read from `ACTIONSTREAM_*` variables

pub mod config;
pub mod hub;
pub mod routes;

use std::{future::Future, sync::Arc};

use actionstream_core::{EmitError, EventEmitter};
use actionstream_executor::{ExecutionService, HttpEmitter, InterpreterPool};
use tokio::net::TcpListener;

pub use config::{ConfigError, ServerConfig};
pub use hub::EventHub;
pub use routes::{AppState, router};

/// Wire the execution service to its emitter.
///
/// Events go to the in-process hub unless an ingest URL is configured.
///
/// # Errors
/// Returns error if the HTTP emitter cannot be built.
pub fn build_state(config: &ServerConfig) -> Result<AppState, EmitError> {
    let hub = EventHub::new();
    let emitter: Arc<dyn EventEmitter> = match &config.ingest_url {
        Some(url) => {
            tracing::info!(%url, "Emitting events over HTTP");
            Arc::new(HttpEmitter::new(url, config.emit_timeout)?)
        }
        None => Arc::new(hub.clone()),
    };
    let service = ExecutionService::new(InterpreterPool::python(&config.interpreter), emitter);
    Ok(AppState {
        service: Arc::new(service),
        hub,
        ping_interval: config.ping_interval,
    })
}

/// Serve until `shutdown` resolves.
///
/// # Errors
/// Returns error if the listener fails.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
