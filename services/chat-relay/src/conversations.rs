//! Conversation endpoints
//!
//! Thin pass-through to the [`ConversationStore`]. Every route requires the
//! `x-session-id` header, which scopes all reads and writes.
//!
//! Endpoints:
//! - POST   /api/conversations               create, optional `{"title": "..."}`
//! - GET    /api/conversations               list for the session, newest first
//! - GET    /api/conversations/{id}/messages stored messages, oldest first
//! - DELETE /api/conversations/{id}          remove with its messages

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use serde::Deserialize;
use tracing::info;

use crate::error::RelayError;
use crate::store::ConversationStore;

pub const SESSION_HEADER: &str = "x-session-id";

const MAX_SESSION_ID_LEN: usize = 128;

/// Extract the caller's session id.
pub fn session_id(headers: &HeaderMap) -> Result<&str, RelayError> {
    let value = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if value.is_empty() {
        return Err(RelayError::InvalidRequest(format!(
            "{SESSION_HEADER} header is required"
        )));
    }
    if value.len() > MAX_SESSION_ID_LEN {
        return Err(RelayError::InvalidRequest(format!(
            "{SESSION_HEADER} must be at most {MAX_SESSION_ID_LEN} bytes"
        )));
    }
    Ok(value)
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

pub fn build_conversation_router(store: Arc<dyn ConversationStore>) -> Router {
    Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/{id}", delete(delete_conversation))
        .route("/api/conversations/{id}/messages", get(list_messages))
        .with_state(store)
}

#[derive(Deserialize, Default)]
struct CreateConversation {
    #[serde(default)]
    title: Option<String>,
}

async fn create_conversation(
    State(store): State<Arc<dyn ConversationStore>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let result = async {
        let session = session_id(&headers)?;
        let request: CreateConversation = if body.is_empty() {
            CreateConversation::default()
        } else {
            serde_json::from_slice(&body).map_err(|e| {
                RelayError::InvalidRequest(format!("malformed conversation request: {e}"))
            })?
        };
        Ok::<_, RelayError>(store.create(session, request.title.as_deref()).await?)
    }
    .await;

    match result {
        Ok(conversation) => {
            info!(conversation_id = %conversation.id, "conversation created");
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "conversation": conversation }),
            )
        }
        Err(e) => e.to_response(&request_id),
    }
}

async fn list_conversations(
    State(store): State<Arc<dyn ConversationStore>>,
    headers: HeaderMap,
) -> Response {
    let request_id = new_request_id();
    let session = match session_id(&headers) {
        Ok(s) => s,
        Err(e) => return e.to_response(&request_id),
    };
    match store.list(session).await {
        Ok(conversations) => json_response(
            StatusCode::OK,
            serde_json::json!({ "conversations": conversations }),
        ),
        Err(e) => RelayError::from(e).to_response(&request_id),
    }
}

async fn list_messages(
    State(store): State<Arc<dyn ConversationStore>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let request_id = new_request_id();
    let session = match session_id(&headers) {
        Ok(s) => s,
        Err(e) => return e.to_response(&request_id),
    };
    match store.messages(session, &id).await {
        Ok(messages) => json_response(StatusCode::OK, serde_json::json!({ "messages": messages })),
        Err(e) => RelayError::from(e).to_response(&request_id),
    }
}

async fn delete_conversation(
    State(store): State<Arc<dyn ConversationStore>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let request_id = new_request_id();
    let session = match session_id(&headers) {
        Ok(s) => s,
        Err(e) => return e.to_response(&request_id),
    };
    match store.delete(session, &id).await {
        Ok(()) => {
            info!(conversation_id = %id, "conversation deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => RelayError::from(e).to_response(&request_id),
    }
}
