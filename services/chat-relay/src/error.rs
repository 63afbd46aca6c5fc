//! Per-request error taxonomy
//!
//! Every failure a chat request can hit maps to exactly one variant, and each
//! variant maps to one HTTP status. Only `Exhausted` sets the `exhausted`
//! flag, so callers can tell "retry later" apart from everything else.
//! Messages never carry key values or raw upstream bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("no upstream API keys are configured")]
    Unconfigured,

    #[error("all upstream API keys are temporarily rate limited, retry later")]
    Exhausted,

    #[error("upstream request failed with status {status}")]
    Upstream { status: StatusCode },

    #[error("upstream unreachable: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Upstream { status } => *status,
            RelayError::Transport(_) => StatusCode::BAD_GATEWAY,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Machine-readable `error.type` value.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Unconfigured => "server_misconfigured",
            RelayError::Exhausted => "keys_exhausted",
            RelayError::Upstream { .. } => "upstream_error",
            RelayError::Transport(_) => "upstream_unreachable",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::NotFound(_) => "not_found",
        }
    }

    /// Label for the `relay_upstream_errors_total` counter, if this is an upstream-side failure.
    pub fn upstream_error_label(&self) -> Option<&'static str> {
        match self {
            RelayError::Exhausted => Some("exhausted"),
            RelayError::Upstream { .. } => Some("status"),
            RelayError::Transport(_) => Some("transport"),
            RelayError::Unconfigured | RelayError::InvalidRequest(_) | RelayError::NotFound(_) => {
                None
            }
        }
    }

    /// JSON error response:
    /// `{"error":{"type":"…","message":"…","request_id":"req_…"},"exhausted":bool}`
    pub fn to_response(&self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "request_id": request_id,
            },
            "exhausted": matches!(self, RelayError::Exhausted),
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<key_pool::Error> for RelayError {
    fn from(err: key_pool::Error) -> Self {
        match err {
            key_pool::Error::Unconfigured => RelayError::Unconfigured,
            key_pool::Error::Exhausted { .. } => RelayError::Exhausted,
        }
    }
}

impl From<crate::store::StoreError> for RelayError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::NotFound(id) => {
                RelayError::NotFound(format!("conversation {id}"))
            }
        }
    }
}
