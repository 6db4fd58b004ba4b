// API 错误响应

use crate::uploader::UploadError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

pub type ApiResult<T> = Result<T, ApiError>;

/// 错误响应体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
    pub error_code: &'static str,
    pub message: String,
    pub details: Option<String>,
    pub path: Option<String>,
    pub upload_id: Option<String>,
    pub chunk_number: Option<u32>,
    pub should_retry: bool,
    pub retry_after_seconds: Option<u64>,
    pub suggestion: Option<&'static str>,
    pub timestamp: DateTime<Utc>,
}

/// HTTP 层错误
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<String>,
    path: Option<String>,
    upload_id: Option<String>,
    chunk_number: Option<u32>,
    should_retry: bool,
    retry_after: Option<u64>,
    suggestion: Option<&'static str>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            path: None,
            upload_id: None,
            chunk_number: None,
            should_retry: false,
            retry_after: None,
            suggestion: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
            .with_suggestion("Check the request parameters and try again")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "UNEXPECTED_ERROR",
            message,
        )
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn with_chunk_number(mut self, chunk_number: u32) -> Self {
        self.chunk_number = Some(chunk_number);
        self
    }

    pub fn with_suggestion(mut self, suggestion: &'static str) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status.as_u16(),
            error: self
                .status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            error_code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
            path: self.path.clone(),
            upload_id: self.upload_id.clone(),
            chunk_number: self.chunk_number,
            should_retry: self.should_retry,
            retry_after_seconds: self.retry_after,
            suggestion: self.suggestion,
            timestamp: Utc::now(),
        }
    }
}

fn status_for(err: &UploadError) -> StatusCode {
    match err {
        UploadError::Validation(_) | UploadError::ChecksumMismatch { .. } => {
            StatusCode::BAD_REQUEST
        }
        UploadError::NotFound(_) => StatusCode::NOT_FOUND,
        UploadError::InvalidState(_) => StatusCode::CONFLICT,
        UploadError::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
        UploadError::Storage(_)
        | UploadError::MissingChunk { .. }
        | UploadError::SizeMismatch { .. }
        | UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn details_for(err: &UploadError) -> Option<String> {
    match err {
        UploadError::MissingChunk { index } => Some(format!("missingChunk={}", index)),
        UploadError::SizeMismatch {
            expected,
            actual,
            percent,
        } => Some(format!(
            "expected={}, actual={}, difference={:.2}%",
            expected, actual, percent
        )),
        UploadError::ChecksumMismatch {
            expected, actual, ..
        } => Some(format!("expected={}, actual={}", expected, actual)),
        _ => None,
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        let mut api = Self::new(status_for(&err), err.code(), err.to_string());
        api.details = details_for(&err);
        api.should_retry = err.is_retryable();
        api.retry_after = err.retry_after_secs();
        api.suggestion = err.suggestion();
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                "API 错误: {} {} (uploadId={:?}, chunk={:?})",
                self.code, self.message, self.upload_id, self.chunk_number
            );
        } else {
            warn!("API 请求被拒绝: {} {}", self.code, self.message);
        }

        let retry_after = self.retry_after;
        let mut response = (self.status, Json(self.body())).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
