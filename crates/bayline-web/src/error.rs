//! JSON error responses and the mapping from domain errors onto HTTP statuses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bayline_core::JobError;
use bayline_square::WindowError;
use bayline_storage::StoreError;
use bayline_sync::{IngestError, ReconcileError};
use serde::Serialize;
use serde_json::Value;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::InvalidTransition { from, to } => {
                Self::new(StatusCode::CONFLICT, "INVALID_TRANSITION", message)
                    .with_details(serde_json::json!({ "from": from, "to": to }))
            }
            JobError::StaleState { expected, actual } => {
                Self::new(StatusCode::CONFLICT, "STALE_STATE", message)
                    .with_details(serde_json::json!({ "expected": expected, "actual": actual }))
            }
            JobError::Forbidden { operation, role } => {
                Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
                    .with_details(serde_json::json!({ "operation": operation, "role": role }))
            }
            JobError::PreconditionFailed { .. } => {
                Self::new(StatusCode::PRECONDITION_FAILED, "PRECONDITION_FAILED", message)
            }
            JobError::Validation { .. } => Self::unprocessable(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(job_id) => Self::not_found(format!("job {job_id} not found")),
            StoreError::Rejected(job_err) => job_err.into(),
            StoreError::Conflict { .. } => {
                Self::new(StatusCode::CONFLICT, "CONFLICT", err.to_string())
            }
            StoreError::Backend(_) => {
                error!(error = %err, "job store failure");
                Self::internal("job store unavailable")
            }
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match &err {
            IngestError::SignatureInvalid => {
                Self::new(StatusCode::UNAUTHORIZED, "SIGNATURE_INVALID", err.to_string())
            }
            IngestError::SignatureMissing => {
                Self::new(StatusCode::UNAUTHORIZED, "SIGNATURE_MISSING", err.to_string())
            }
            IngestError::SignatureKeyMissing => Self::internal(err.to_string()),
            IngestError::MalformedPayload(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "MALFORMED_PAYLOAD", err.to_string())
            }
            IngestError::InvalidBooking { missing, .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INVALID_BOOKING", err.to_string())
                    .with_details(serde_json::json!({ "missing": missing }))
            }
            IngestError::Persistence(_) => {
                error!(error = %err, "webhook persistence failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR", err.to_string())
            }
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        if let ReconcileError::InvalidWindow(window_err) = err {
            return window_err.into();
        }
        error!(error = %err, "reconciliation failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "RECONCILE_FAILED", err.to_string())
    }
}

impl From<WindowError> for ApiError {
    fn from(err: WindowError) -> Self {
        let WindowError::DaysOutOfRange { field, value } = err;
        Self::new(StatusCode::BAD_REQUEST, "INVALID_WINDOW", err.to_string())
            .with_details(serde_json::json!({ "field": field, "value": value }))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "INVALID_BODY", rejection.body_text())
    }
}
