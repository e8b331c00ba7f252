//! Admin API routes

use crate::auth::{admin_key_middleware, AppState};
use crate::handlers;
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Assemble the admin router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let gated = Router::new()
        .route("/v1/messages", get(handlers::list_messages))
        .route("/v1/messages/:id", get(handlers::get_message))
        .route("/v1/messages/:id/raw", get(handlers::get_message_raw))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_key_middleware,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
