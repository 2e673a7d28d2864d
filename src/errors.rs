//! API error type rendered as the standard error envelope:
//! `{detail, error_code, request_id, upload_id?, trace_id?}`.
//!
//! Service layers keep their own `thiserror` enums; this type is the single
//! boundary between those and HTTP.

use crate::services::limits::RefusalReason;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Error families, each with a fixed status code and wire `error_code`.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Bad inputs; not retryable.
    Validation,
    /// Missing or unparseable credential.
    Auth,
    /// Valid credential, insufficient rights (ownership, admin).
    Forbidden,
    NotFound,
    /// Idempotency mismatch or illegal state transition.
    Conflict,
    /// Upload already in a terminal state at complete time.
    Terminal,
    /// Body integrity mismatch.
    Checksum,
    /// Admission refused; carries the limiter that said no.
    Backpressure(RefusalReason),
    /// Per-principal request rate exceeded.
    RateLimited,
    /// Body exceeds the upload's chunk size.
    PayloadTooLarge,
    /// Malformed or unsatisfiable range request.
    Range,
    /// Durable-queue completion wait timed out; the task keeps running.
    QueueTimeout,
    /// Storage failure that survived the retry budget.
    Storage,
    Internal,
}

impl ErrorKind {
    fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Terminal => StatusCode::LOCKED,
            ErrorKind::Checksum => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Backpressure(_) | ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Range => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorKind::QueueTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Storage | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ErrorKind::Validation | ErrorKind::PayloadTooLarge => "validation",
            ErrorKind::Auth | ErrorKind::Forbidden => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict | ErrorKind::Terminal => "conflict",
            ErrorKind::Checksum => "checksum",
            ErrorKind::Backpressure(_) => "backpressure",
            ErrorKind::RateLimited => "throttled",
            ErrorKind::Range => "range",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::Storage => "permanent_storage",
            ErrorKind::Internal => "internal",
        }
    }
}

/// An API-visible error with enough context for the error envelope.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
    pub request_id: Option<String>,
    pub upload_id: Option<String>,
    pub trace_id: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            request_id: None,
            upload_id: None,
            trace_id: None,
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    pub fn checksum(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Checksum, detail)
    }

    pub fn range(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Range, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    pub fn backpressure(reason: RefusalReason) -> Self {
        Self::new(ErrorKind::Backpressure(reason), reason.detail())
    }

    /// Attach the request id from the request-context middleware.
    pub fn with_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    /// Attach the upload id when the route names one.
    pub fn with_upload(mut self, upload_id: &str) -> Self {
        self.upload_id = Some(upload_id.to_string());
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = Json(json!({
            "detail": self.detail,
            "error_code": self.kind.error_code(),
            "request_id": self.request_id.as_deref().unwrap_or("unknown"),
            "upload_id": self.upload_id,
            "trace_id": self.trace_id,
        }));

        let mut response = (status, body).into_response();
        match self.kind {
            ErrorKind::Backpressure(reason) => {
                let headers = response.headers_mut();
                headers.insert("Retry-After", HeaderValue::from_static("1"));
                headers.insert(
                    "X-Backpressure-Reason",
                    HeaderValue::from_static(reason.as_str()),
                );
            }
            ErrorKind::RateLimited => {
                response
                    .headers_mut()
                    .insert("Retry-After", HeaderValue::from_static("1"));
            }
            _ => {}
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<crate::services::metadata::MetadataError> for ApiError {
    fn from(err: crate::services::metadata::MetadataError) -> Self {
        match err {
            crate::services::metadata::MetadataError::UploadNotFound(id) => {
                ApiError::not_found(format!("upload `{}` not found", id))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<crate::services::storage::StorageError> for ApiError {
    fn from(err: crate::services::storage::StorageError) -> Self {
        ApiError::new(ErrorKind::Storage, err.to_string())
    }
}

impl From<crate::services::queue::QueueError> for ApiError {
    fn from(err: crate::services::queue::QueueError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::internal(format!("database error: {}", err))
    }
}
