//! Welcomer Images - welcome image rendering service
//!
//! This binary serves generated images over HTTP and runs the janitor.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use welcomer_common::{Config, ImageMetrics};
use welcomer_images::janitor::{Janitor, janitor_loop};
use welcomer_images::{AppState, router};

#[derive(Parser, Debug)]
#[command(name = "welcomer-images")]
#[command(about = "Welcome image rendering service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "welcomer-images.toml")]
    config: String,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = Config::load(&args.config)?;
    let missing_config = loaded.is_none();
    let mut config = loaded.unwrap_or_default();
    if let Some(listen) = args.listen {
        config.http.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting welcomer-images");
    if missing_config {
        warn!("Configuration file {} not found, using defaults", args.config);
    }
    if config.store.allow_anonymous_access {
        warn!("Anonymous access is ENABLED for POST /images");
    } else if config.api_keys.is_empty() {
        warn!("No API keys configured, POST /images will reject every request");
    }

    let metrics = Arc::new(ImageMetrics::new());
    let state = Arc::new(AppState::from_config(config, Arc::clone(&metrics))?);
    info!(
        "Quantizer limit: {} concurrent frames",
        state.generator.gate().limit()
    );

    let janitor = Arc::new(Janitor::new(
        state.store.clone(),
        Arc::clone(&state.generator),
        metrics,
        state.config.store.store_path.clone(),
    ));
    let janitor_interval = state.config.cache.janitor_interval();
    info!("Janitor interval: {}s", janitor_interval.as_secs());
    let janitor_handle = tokio::spawn(janitor_loop(janitor, janitor_interval));

    let addr: SocketAddr = state
        .config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", state.config.http.listen, e))?;
    let drain_timeout = Duration::from_secs(state.config.shutdown.drain_timeout_secs);

    info!("Starting HTTP server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    let app = router(Arc::clone(&state));

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(
                "Shutting down, draining {} in-flight generations",
                shutdown_state.inflight.count()
            );
            shutdown_state.inflight.close();
            if !shutdown_state.inflight.wait_idle(drain_timeout).await {
                warn!(
                    "Drain timed out after {}s with {} generations in flight",
                    drain_timeout.as_secs(),
                    shutdown_state.inflight.count()
                );
            }
        })
        .await?;

    janitor_handle.abort();
    info!("welcomer-images shut down gracefully");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
