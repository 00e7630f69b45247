//! Foreman server - main entry point

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use foreman_api::{routes, AppState};
use foreman_common::{init_tracing, Settings};
use foreman_db::{create_pool, run_migrations, DatabaseConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings.log_level);

    let pool = create_pool(&DatabaseConfig::new(&settings.database_url))
        .await
        .context("connecting to database")?;

    if settings.auto_migrate {
        run_migrations(&pool).await.context("running migrations")?;
        tracing::info!("migrations applied");
    }

    let host: IpAddr = settings.host.parse().context("parsing HOST")?;
    let addr = SocketAddr::new(host, settings.port);

    let state = AppState::new(pool, settings);

    // The reaper is a process-wide singleton owned by the server task
    let reaper_handle = tokio::spawn(state.reaper().run());

    let app = routes::api_routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("foreman server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    reaper_handle.abort();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    tracing::info!("shutdown signal received");
}
