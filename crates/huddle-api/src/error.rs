use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use huddle_db::ChatError;
use huddle_types::api::{ErrorKind, ErrorResponse};

/// A failed chat operation as an HTTP response with a JSON `{error, message}` body.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Forbidden | ErrorKind::NotAuthorized => StatusCode::FORBIDDEN,
        ErrorKind::InvalidState | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AttachmentUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: kind,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
