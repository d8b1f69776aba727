//! Meridian server binary.
//!
//! Boots a node from a TOML configuration file and serves the HTTP API.

use anyhow::Context;
use clap::Parser;
use meridian::api::build_router;
use meridian::config::Config;
use meridian::server::Server;
use tokio::signal;
use tracing::info;

/// Meridian time-series database server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "MERIDIAN_CONFIG")]
    config: Option<String>,

    /// Bind address for the HTTP API (overrides [data] port)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path).context("loading configuration")?,
        None => Config::default(),
    };

    meridian::telemetry::init_logging(&config.logging).context("initializing logging")?;

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.data.port));

    info!(
        bind = bind.as_str(),
        leader = config.initialization.join_urls.is_empty(),
        auth = config.authentication.enabled,
        "starting meridian"
    );

    let server = Server::open(config).await.context("opening server")?;
    let router = build_router(server.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %listener.local_addr()?, "http api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    info!("meridian shutting down");
    server.close();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
