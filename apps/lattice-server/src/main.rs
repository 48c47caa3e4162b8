use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lattice_server::config::Config;
use lattice_server::store::Stores;
use lattice_server::PlatformService;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // In-memory stores for single-node operation. Swap for the real store
    // implementations when running against a database.
    let stores = Stores::in_memory();

    let platform = PlatformService::new(config, stores, None);
    platform.start();

    tracing::info!(port, "lattice-server configured");

    let app = Router::new()
        .merge(lattice_server::gateway::router())
        .layer(TraceLayer::new_for_http())
        .with_state(platform.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "lattice-server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    let shutdown_platform = platform.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_platform.shutdown().await;
        })
        .await
        .expect("server error");
}
