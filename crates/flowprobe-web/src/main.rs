//! flowprobe-web - HTTP+JSON control surface for a running capture daemon's flow store (§6).

mod handlers;
mod openapi;
mod state;
mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use flowprobe_core::config::Config;

use crate::openapi::ApiDoc;
use crate::state::{AppStateInner, SharedState};

/// HTTP+JSON control surface for flowprobed.
#[derive(Parser)]
#[command(name = "flowprobe-web", about = "flowprobe HTTP+JSON control surface", version)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "FLOWPROBE_LISTEN")]
    listen: String,

    /// Path to a YAML configuration file.
    #[arg(long, env = "FLOWPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory for the on-disk flow store (overrides the config file's db_path).
    #[arg(short = 'd', long, env = "FLOWPROBE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level (overrides the config file's log_level).
    #[arg(long, env = "FLOWPROBE_LOG_LEVEL")]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.display().to_string();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flowprobe_web={}", config.log_level).parse().unwrap()),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args, config));
}

async fn async_main(args: Args, config: Config) {
    let db_root = PathBuf::from(&config.db_path);
    if let Err(e) = std::fs::create_dir_all(&db_root) {
        eprintln!("failed to create db root '{}': {e}", db_root.display());
        std::process::exit(1);
    }

    info!(db_root = %db_root.display(), "flowprobe-web {} starting", env!("CARGO_PKG_VERSION"));

    let inner = AppStateInner::new(db_root, config, args.config.clone());
    let watchdog = inner.watchdog.clone();
    let state: SharedState = std::sync::Arc::new(inner);
    let watchdog_handle = watchdog.spawn_background(std::time::Duration::from_secs(1));

    let app = Router::new()
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/_query", post(handlers::handle_query))
        .route("/status", get(handlers::handle_status))
        .route("/status/{iface}", get(handlers::handle_status_one))
        .route("/config", get(handlers::handle_config).put(handlers::handle_config_put))
        .route("/config/{iface}", get(handlers::handle_config_one))
        .route("/config/_reload", post(handlers::handle_config_reload))
        .route("/flows", get(handlers::handle_flows))
        .route("/flows/{iface}", get(handlers::handle_flows_one))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new());

    let addr: SocketAddr = args.listen.parse().expect("invalid listen address");
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");
    let serve_result = axum::serve(listener, app).await;

    watchdog.stop();
    let _ = watchdog_handle.join();
    serve_result.expect("server error");
}
