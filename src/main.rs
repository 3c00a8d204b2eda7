use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mirrorcache::config::Config;
use mirrorcache::http::handler::create_router;

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- Config ----
    let config = Config::parse();
    if let Err(err) = config.validate() {
        eprintln!("configuration error: {err:#}");
        process::exit(2);
    }

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_ascii_lowercase())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        cache_root = %config.cache_root.display(),
        "starting mirrorcache"
    );

    // ---- Ensure the mirror root exists ----
    tokio::fs::create_dir_all(&config.cache_root)
        .await
        .with_context(|| {
            format!(
                "failed to create cache root: {}",
                config.cache_root.display()
            )
        })?;

    // ---- App state ----
    let listen_addr: std::net::SocketAddr = config
        .listen_addr
        .parse()
        .context("invalid listen address")?;
    let state = mirrorcache::build_state(config);
    let app = create_router(Arc::new(state));

    // ---- Serve ----
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("mirrorcache shut down cleanly");
    Ok(())
}
