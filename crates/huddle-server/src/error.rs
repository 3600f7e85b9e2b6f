//! HTTP API errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use huddle_core::{FanoutError, NotifyError, StoreError};
use thiserror::Error;
use tracing::error;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),
}

fn store_status(error: &StoreError) -> StatusCode {
    match error {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Notify(e) => match e {
                NotifyError::Store(e) => store_status(e),
                NotifyError::RequestNotFound(_) | NotifyError::UserNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                NotifyError::NotAuthorized => StatusCode::FORBIDDEN,
                NotifyError::SelfRequest => StatusCode::BAD_REQUEST,
                NotifyError::AlreadyResolved
                | NotifyError::AlreadyFriends
                | NotifyError::RequestPending => StatusCode::CONFLICT,
            },
            ApiError::Fanout(FanoutError::Store(e)) | ApiError::Store(e) => store_status(e),
            ApiError::Fanout(FanoutError::EmptyMessage) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(NotifyError::NotAuthorized).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(NotifyError::AlreadyResolved).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(NotifyError::RequestNotFound("r1".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(FanoutError::EmptyMessage).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(FanoutError::Store(StoreError::Unavailable("db".into()))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
