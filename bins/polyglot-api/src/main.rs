mod channel;
mod client;
mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use polyglot_common::config::{LogFormat, RateLimitKey, ServerConfig};
use polyglot_engine::backend::{js_worker, BackendOptions};
use polyglot_engine::{Coordinator, CoordinatorOptions, LanguageConfigManager, Ledger, RateLimiter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    /// How callers are identified for rate limiting
    pub rate_limit_key: RateLimitKey,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn main() -> anyhow::Result<()> {
    // The server binary doubles as its own JavaScript worker
    if let Some(code) = js_worker::run_if_requested() {
        std::process::exit(code);
    }
    serve()
}

#[tokio::main]
async fn serve() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    init_tracing(config.log_format);

    info!("Polyglot API booting...");

    let languages = LanguageConfigManager::load_or_default(&config.languages_config)
        .with_context(|| {
            format!(
                "Failed to load language configuration from {}",
                config.languages_config.display()
            )
        })?;
    info!(
        languages = ?languages.list_languages(),
        path = %config.languages_config.display(),
        "Language configuration loaded"
    );

    let coordinator = Coordinator::new(
        &languages,
        &BackendOptions {
            js_loop_iteration_limit: config.js_loop_iteration_limit,
            js_worker_program: config.js_worker_program.clone(),
        },
        RateLimiter::new(&config.rate_limit),
        Arc::new(Ledger::new()),
        CoordinatorOptions::from_config(&config),
    )?;
    info!(
        scratch_dir = %config.scratch_dir.display(),
        default_timeout_ms = config.default_timeout_ms,
        max_timeout_ms = config.max_timeout_ms,
        max_output_bytes = config.max_output_bytes,
        rate_limit_max = config.rate_limit.max_requests,
        rate_limit_window_secs = config.rate_limit.window.as_secs(),
        "Execution coordinator ready"
    );

    metrics::init();

    let state = Arc::new(AppState {
        coordinator,
        rate_limit_key: config.rate_limit.key,
    });
    let app = routes::app(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("HTTP server listening on {}", config.bind_addr);
    info!("Ready to accept executions");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Polyglot API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
