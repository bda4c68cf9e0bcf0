use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/**
 * \brief Request-level failures. Each one stops the request and is reported
 *        to the caller.
 * \details Per-item failures (an unreadable image part, one malformed stream
 *          frame) are not represented here; they are absorbed where they occur.
 */
#[derive(Debug, Error)]
pub enum ChatError {
    /** \brief Malformed request; rejected before any side effect. */
    #[error("validation failed: {0}")]
    Validation(String),

    /** \brief Unknown profile, conversation or message. */
    #[error("not found: {0}")]
    NotFound(String),

    /** \brief The completion endpoint answered with a non-success status. */
    #[error("upstream returned {status}: {body}")]
    Upstream {
        status: StatusCode,
        body: String,
        debug: Option<Value>,
    },

    /** \brief The completion endpoint could not be reached or returned garbage. */
    #[error("upstream unreachable: {message}")]
    Transport {
        message: String,
        debug: Option<Value>,
    },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Upstream { status, .. } => *status,
            ChatError::Transport { .. } => StatusCode::BAD_GATEWAY,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /**
     * \brief JSON body `{error, debug?}` sent to the caller.
     */
    pub fn body(&self) -> Value {
        let (message, debug) = match self {
            ChatError::Validation(m) | ChatError::NotFound(m) => (m.clone(), None),
            ChatError::Upstream { body, debug, .. } => (body.clone(), debug.clone()),
            ChatError::Transport { message, debug } => (message.clone(), debug.clone()),
            ChatError::Storage(_) => ("internal server error".to_string(), None),
        };
        let mut out = json!({ "error": message });
        if let Some(debug) = debug {
            out["debug"] = debug;
        }
        out
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        match &self {
            ChatError::Storage(e) => tracing::error!(error = ?e, "storage error"),
            ChatError::Upstream { status, .. } => {
                tracing::warn!(%status, "upstream rejected request")
            }
            ChatError::Transport { message, .. } => {
                tracing::warn!(%message, "upstream transport failure")
            }
            _ => {}
        }
        (self.status(), Json(self.body())).into_response()
    }
}
