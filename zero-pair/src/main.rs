//! zero-pair service entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use zero_common::config::Config;
use zero_common::logging::init_logging;
use zero_pair::{build_router, AppState};

/// HTTP front-end for AI pair-programming sessions.
#[derive(Debug, Parser)]
#[command(name = "zero-pair", version, about)]
struct Args {
    /// Path to a JSON config file (defaults to ~/.zero-pair/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();
    let args = Args::parse();

    let mut config = Config::load_with_env(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.network.bind = bind;
    }
    config.validate().context("Invalid configuration")?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Zero Pair v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        provider = config.llm.provider.as_str(),
        model = %config.llm.default_model,
        work_dir = %config.sessions.default_work_dir.display(),
        "Completion backend configured"
    );

    let state = AppState::from_config(&config);
    let registry = state.registry.clone();
    let sweeper = registry.spawn_sweeper();

    let mut app =
        build_router(state).layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes));
    if config.server.cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    let addr = format!("{}:{}", config.bind_address(), config.server.port);

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    tracing::info!("Starting HTTP server on {}", config.endpoint());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    registry.shutdown_all().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
