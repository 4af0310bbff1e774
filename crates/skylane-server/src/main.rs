//! Skylane server - corridor route planning over HTTP.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skylane_server::api;
use skylane_server::config::Config;
use skylane_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("skylane_server=debug".parse()?))
        .init();

    tracing::info!("Starting Skylane server...");

    let config = Config::from_env();
    let port = config.server_port;
    if config.terrain_key.is_empty() {
        tracing::warn!("SKYLANE_TERRAIN_KEY is not set; tile requests may be rejected");
    }
    tracing::info!(
        url = %config.terrain_url,
        zoom = config.terrain_zoom,
        max_in_flight = config.terrain_max_in_flight,
        require = config.terrain_require,
        "Terrain source configured"
    );
    let state = Arc::new(AppState::new(config)?);

    // Build the app
    let app = api::routes().with_state(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    // Run server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
