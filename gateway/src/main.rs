//! Binary entry point: loads configuration, builds the assembled axum
//! router via `avika_gateway::app::assemble`, and serves it.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use avika_gateway::app::{self, InMemoryUserDirectory};
use avika_observability::{init_tracing, TracingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = avika_gateway::config::load()?;
    init_tracing(&TracingConfig::default())?;

    let directory = Arc::new(InMemoryUserDirectory::new());
    let assembled = app::assemble(config, directory).await?;

    let addr: SocketAddr = "0.0.0.0:8080".parse()?;
    info!(%addr, "starting avika gateway");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        assembled
            .router
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    assembled.sessions.shutdown();
    assembled.rate_limiter.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
