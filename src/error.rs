use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{canonical::Rejection, fetcher::FetchError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

/// Error returned by every handler and by server startup.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    pub fn rejected_url(rejection: Rejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("Invalid or unsupported YouTube URL: {rejection}."),
            code: Some(rejection.code()),
        }
    }

    pub fn download_failed(error: &FetchError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("Download failed: {error}"),
            code: Some("DOWNLOAD_FAILED"),
        }
    }

    pub fn file_too_large(max_bytes: u64) -> Self {
        let max_mb = max_bytes / 1_048_576;
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("The file exceeds the {max_mb} MB download limit."),
            code: Some("FILE_TOO_LARGE"),
        }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self::rejected_url(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}
