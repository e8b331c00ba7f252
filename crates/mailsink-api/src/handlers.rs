//! Admin API handlers
//!
//! A read-through onto the index database plus raw body fetch. Bodies come
//! from the local spool until the uploader has replicated them, then from
//! the object store.

use crate::auth::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mailsink_common::Error;
use mailsink_storage::MessageRow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub domain: Option<String>,
    pub mailbox: Option<String>,
    /// Opaque cursor `received_at:id` from a previous page.
    pub after: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub items: Vec<MessageRow>,
    pub next: String,
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessageListResponse>, StatusCode> {
    let (Some(domain), Some(mailbox)) = (query.domain, query.mailbox) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let items = state
        .db
        .list_messages(
            &domain,
            &mailbox,
            query.after.as_deref(),
            query.limit.unwrap_or(50),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "list messages failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let next = items
        .last()
        .map(|row| format!("{}:{}", row.received_at, row.id))
        .unwrap_or_default();

    Ok(Json(MessageListResponse { items, next }))
}

pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageRow>, StatusCode> {
    let row = state.db.get_message(&id).await.map_err(|e| {
        error!(error = %e, "get message failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    row.map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn get_message_raw(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    let row = state
        .db
        .get_message(&id)
        .await
        .map_err(|e| {
            error!(error = %e, "get message failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let body = if row.object_key.is_empty() {
        tokio::fs::read(&row.eml_path).await.map_err(|e| {
            error!(error = %e, path = %row.eml_path, "open spooled body failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
    } else {
        let Some(store) = &state.object_store else {
            error!("message has object_key but no object store is configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        };
        match store.get(&row.object_key).await {
            Ok(body) => body,
            Err(Error::NotFound(_)) => return Err(StatusCode::NOT_FOUND),
            Err(e) => {
                error!(error = %e, key = %row.object_key, "object fetch failed");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    };

    Ok(([(header::CONTENT_TYPE, "message/rfc822")], body).into_response())
}
