//! API route definitions

mod agents;
mod health;
mod runs;
mod steps;
mod stories;
mod workflows;

use axum::Router;

use crate::AppState;

/// Build the API router with all routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .nest("/workflows", workflows::routes())
        .nest("/runs", runs::routes())
        .nest("/steps", agents::routes())
        .merge(crate::ws::routes())
}
