//! Foreman API - HTTP handlers and routing
//!
//! This crate provides the Axum-based HTTP API for the orchestrator:
//! - Workflow, run, step, and story endpoints
//! - Agent polling verbs
//! - WebSocket support for real-time updates
//! - Bearer-token authentication via the CurrentUser extractor

pub mod error;
pub mod extractors;
pub mod routes;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use state::AppState;
