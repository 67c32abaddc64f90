use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use mingle_gateway::dispatcher::DispatchError;

/// Request-boundary error taxonomy. Validation failures are translated
/// here; fan-out failures never are — delivery is not part of a send's
/// success contract.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Conflict(String),
    /// Duplicate DIRECT conversation: the response carries the existing
    /// conversation id so the client can redirect to it.
    #[error("conversation with this user already exists")]
    DuplicateDirect { conversation_id: Uuid },
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::DuplicateDirect { .. } => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let Self::Internal(e) = &self {
            error!("Internal error serving request: {:#}", e);
        }

        let body = match &self {
            Self::DuplicateDirect { conversation_id } => serde_json::json!({
                "error": self.to_string(),
                "conversation_id": conversation_id,
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::ConversationNotFound => Self::NotFound("conversation not found".into()),
            DispatchError::NotParticipant => {
                Self::Forbidden("sender is not a participant of the conversation".into())
            }
            DispatchError::AttachmentType(t) => {
                Self::InvalidInput(format!("attachment type not allowed: {}", t))
            }
            DispatchError::Storage(e) => Self::Storage(e),
            DispatchError::Internal(e) => Self::Internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        let cases = [
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ApiError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::DuplicateDirect { conversation_id: Uuid::nil() },
                StatusCode::CONFLICT,
            ),
            (ApiError::Storage("x".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
