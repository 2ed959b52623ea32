//! HTTP API surface.

pub mod auth;
mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;

use crate::collector::StatementsCollector;
use auth::{SessionValidator, session_auth_middleware};

/// Assembles the agent's router: `GET /statements` behind the session
/// middleware, plus the unauthenticated health probe.
pub fn build_router(
    collector: Arc<StatementsCollector>,
    sessions: Arc<dyn SessionValidator>,
) -> Router {
    Router::new()
        .route("/statements", get(handlers::handle_statements))
        .route("/health", get(handlers::handle_health))
        .layer(axum::middleware::from_fn_with_state(
            sessions,
            session_auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(collector)
}
