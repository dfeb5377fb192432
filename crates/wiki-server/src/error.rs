use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use wiki_core::WikiError;

#[derive(Debug)]
pub enum ApiError {
    Wiki(WikiError),
    BadRequest(String),
    /// Extractor failure that carries its own status, e.g. 413 for an oversized upload.
    Rejected(StatusCode, String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Wiki(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Wiki(
                WikiError::InvalidTitle(_) | WikiError::InvalidDate(_) | WikiError::HomePageRename,
            ) => StatusCode::BAD_REQUEST,
            // Conflicts: the client re-fetches or picks another title.
            ApiError::Wiki(e) if e.is_recoverable() => StatusCode::CONFLICT,
            ApiError::Wiki(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Rejected(status, _) => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Wiki(e) => e.to_string(),
            ApiError::BadRequest(msg) | ApiError::Rejected(_, msg) | ApiError::Internal(msg) => {
                msg.clone()
            }
        }
    }
}

impl From<WikiError> for ApiError {
    fn from(e: WikiError) -> Self {
        ApiError::Wiki(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::Rejected(e.status(), e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "Request failed");
        } else {
            tracing::debug!(%status, error = %message, "Request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}
