//! Action stream server.
//!
//! Run with: cargo run -p actionstream-server
//!
//! Settings come from `ACTIONSTREAM_*` variables, logging from `RUST_LOG`.

use actionstream_server::{ServerConfig, build_state, serve};
use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let state = build_state(&config)?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    let addr = listener.local_addr()?;
    println!("listening on http://{addr}");
    tracing::info!(interpreter = %config.interpreter, "Server listening on http://{addr}");

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    })
    .await?;
    Ok(())
}
