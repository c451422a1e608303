use std::io;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use mss_storage::{is_storage_full, MetadataError};

/// Failure classes a storage request can end in. The response never carries
/// more than the status and its reason phrase; details go to the log at the
/// point where the error is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    Unauthorized,
    BadRequest,
    NotFound,
    Forbidden,
    InsufficientStorage,
    Internal,
}

impl ApiError {
    pub fn status(self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            ApiError::NotFound
        } else if is_storage_full(err) {
            ApiError::InsufficientStorage
        } else {
            ApiError::Internal
        }
    }

    pub fn from_metadata(err: &MetadataError) -> Self {
        if err.is_not_found() {
            ApiError::NotFound
        } else if err.is_storage_full() {
            ApiError::InsufficientStorage
        } else {
            ApiError::Internal
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        status_text(self.status())
    }
}

/// Plain-text response holding only the reason phrase of `status`.
pub fn status_text(status: StatusCode) -> Response {
    let body = format!("{}\n", status.canonical_reason().unwrap_or_default());
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        body,
    )
        .into_response()
}
