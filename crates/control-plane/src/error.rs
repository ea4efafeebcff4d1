use axum::{response::{IntoResponse, Response}, Json, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody { pub code: &'static str, pub message: String }

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub code: &'static str, pub message: String }

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }
    pub fn service_unavailable() -> Self { Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", "Required dependency not ready") }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::new(StatusCode::NOT_FOUND, "not_found", msg) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg) }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.code, self.message) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { code: self.code, message: self.message };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Failures of the upload pipeline.
///
/// The `Display` text is for operators only; clients get [`PipelineError::client_message`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("application not found: {0}")]
    NotFound(String),
    #[error("application slug conflict: {0}")]
    Conflict(String),
    #[error("registry unavailable: {0:#}")]
    Registry(anyhow::Error),
    #[error("malformed upload: {0}")]
    Parse(String),
    #[error("object storage failure: {0:#}")]
    Storage(anyhow::Error),
    #[error("scheduler failure: {0:#}")]
    Scheduler(anyhow::Error),
    #[error("deploy history write failed: {0:#}")]
    HistoryWrite(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Registry(_) => "registry",
            Self::Parse(_) => "parse",
            Self::Storage(_) => "storage",
            Self::Scheduler(_) => "scheduler",
            Self::HistoryWrite(_) => "history_write",
            Self::Internal(_) => "internal",
        }
    }

    /// Generic message safe to hand back to the uploader.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid application slug",
            Self::NotFound(_) => "application not found",
            Self::Conflict(_) => "duplicate application",
            Self::Registry(_) => "duplicate application and/or error",
            Self::Parse(_) => "unable to parse the upload",
            Self::Storage(_) => "storage of data failed",
            Self::Scheduler(_) => "could not schedule deployment",
            Self::HistoryWrite(_) => "deploy history not recorded",
            Self::Internal(_) => "internal error",
        }
    }

    /// Soft errors are reported but never fail a request.
    pub fn is_soft(&self) -> bool { matches!(self, Self::HistoryWrite(_)) }
}

/// Error body of the upload endpoint: `{"Error": "<message>"}`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadErrorBody {
    #[serde(rename = "Error")]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_hides_internal_detail() {
        let e = PipelineError::Storage(anyhow::anyhow!("AccessDenied: secret key abc123 rejected"));
        assert_eq!(e.client_message(), "storage of data failed");
        assert!(e.to_string().contains("abc123"));
        assert_eq!(e.kind(), "storage");
    }

    #[test]
    fn only_history_write_is_soft() {
        assert!(PipelineError::HistoryWrite(anyhow::anyhow!("x")).is_soft());
        assert!(!PipelineError::Scheduler(anyhow::anyhow!("x")).is_soft());
        assert!(!PipelineError::NotFound("demo".into()).is_soft());
    }

    #[test]
    fn upload_error_body_shape() {
        let v = serde_json::to_value(UploadErrorBody { error: "storage of data failed".into() }).unwrap();
        assert_eq!(v, serde_json::json!({"Error": "storage of data failed"}));
    }
}
