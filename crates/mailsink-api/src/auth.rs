//! Admin API state and access gate

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use mailsink_storage::{IndexDb, ObjectStore};
use std::sync::Arc;
use tracing::warn;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: IndexDb,
    pub object_store: Option<Arc<ObjectStore>>,

    /// Shared secret for the `X-Admin-Key` header. When unset the API is
    /// open, which is acceptable because it binds to localhost by default.
    pub api_key: Option<String>,
}

/// Require the shared admin key when one is configured.
pub async fn admin_key_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if key == expected => Ok(next.run(req).await),
        _ => {
            warn!("admin request rejected: missing or wrong X-Admin-Key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
