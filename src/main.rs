use moldrelay::db::init_db;
use moldrelay::handlers::router;
use moldrelay::store::Store;
use moldrelay::upstream::{AgentEndpoints, UpstreamClient};
use moldrelay::{AppState, Args};

use clap::Parser;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Arc::new(Args::parse());

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "moldrelay=debug,tower_http=info".into(),
    };

    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "moldrelay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let trace_appender = tracing_appender::rolling::daily(&args.log_dir, "trace_buffer.json");
    let (trace_non_blocking, _trace_guard) = tracing_appender::non_blocking(trace_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(moldrelay::trace_layer::NdjsonTraceLayer::new(
            moldrelay::redaction_layer::RedactingWriter::new(trace_non_blocking),
        ))
        .with(tracing_error::ErrorLayer::default())
        .init();

    moldrelay::logging::setup_panic_hook();

    let endpoints = match AgentEndpoints::from_env() {
        Some(e) => e,
        None => {
            eprintln!("Error: AGENT_ENDPOINT environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Agent endpoint: {} (tcg: {}, search: {})",
        endpoints.default,
        endpoints.tcg.as_deref().unwrap_or("-"),
        endpoints.search.as_deref().unwrap_or("-")
    );

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let upstream = match UpstreamClient::new(&args.upstream_config()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e.inner);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(
        Store::new(db),
        upstream,
        endpoints,
        args.clone(),
    ));
    let app = router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("moldrelay listening on {}", addr);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutting down");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}
