mod config;
mod connection;
mod routes;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use gateway_core::generator::OpaqueGenerator;
use gateway_core::{Registry, RegistryConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;

/// Chars-per-token approximation used by the opaque generator's token
/// estimate (spec.md §4.3 has no real tokenizer in scope).
const OPAQUE_TOKENS_PER_CHAR: f64 = 0.25;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Config,
}

#[tokio::main]
/// Loads configuration, activates structured logging, then serves the v1
/// and v2 WebSocket routes alongside the status endpoints. Listens on
/// `config.bind_addr`.
async fn main() {
    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("config load error: {message}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.gary.logging.directives());

    let registry_config = RegistryConfig {
        existing_connection_policy: config.gary.existing_connection_policy,
        idle_timeout_try: config.gary.scheduler.idle_timeout_try(),
        idle_timeout_force: config.gary.scheduler.idle_timeout_force(),
        allow_yapping: config.gary.allow_yapping,
        enforce_schema: config.gary.enforce_schema,
        token_limit: config.gary.token_limit,
        temperature: config.gary.temperature,
        max_tokens: config.gary.max_tokens,
    };
    let generator_factory: gateway_core::GeneratorFactory =
        Arc::new(|| Box::new(OpaqueGenerator::new(OPAQUE_TOKENS_PER_CHAR)));
    let registry = Arc::new(Registry::new(registry_config, generator_factory));

    let bind_addr = config.bind_addr;
    let state = Arc::new(AppState { registry, config });

    let watchdog_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let games = watchdog_state.registry.list_games().await;
            let connected = games.iter().filter(|g| g.connected).count();
            tracing::debug!(total = games.len(), connected, "registry snapshot");
        }
    });

    let app = Router::new()
        .route("/ws", get(ws::v1_handler))
        .route("/v2/{game}", get(ws::v2_path_handler))
        .route("/v2", get(ws::v2_query_handler))
        .route("/games", get(routes::games_handler))
        .route("/healthz", get(routes::healthz_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    tracing::info!(%bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .unwrap();
}

/// Sets up `tracing-subscriber` exactly as the teacher's `main.rs` does
/// (`with_file`, `with_line_number`, `with_target`, `with_thread_ids`,
/// `with_thread_names`), appending the config's per-module overrides
/// (`original_source/config.py::LoggingConfig.modules`) to the base filter.
fn init_tracing(module_directives: &str) {
    let base = format!("{}=trace", env!("CARGO_CRATE_NAME"));
    let directive = if module_directives.is_empty() {
        base
    } else {
        format!("{base},{module_directives}")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| directive.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();
}

async fn shutdown_signal(state: Arc<AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, closing games");
    state.registry.shutdown().await;
}
