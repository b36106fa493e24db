use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure of a single target or of batch validation.
///
/// Every per-target variant carries the originating target so that the
/// boundary can log which URL broke a batch even though the caller only
/// sees an opaque failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("Invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Transport error for {target}: {message}")]
    Transport { target: String, message: String },

    #[error("Upstream {target} responded with status {status}")]
    Upstream { target: String, status: u16 },

    #[error("Failed to decode payload from {target}: {message}")]
    Decode { target: String, message: String },

    #[error("Batch of {count} targets exceeds the maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("Fetch worker failed: {message}")]
    WorkerFailed { message: String },
}

impl FetchError {
    /// Stable label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidTarget { .. } => "invalid_target",
            FetchError::Transport { .. } => "transport",
            FetchError::Upstream { .. } => "upstream",
            FetchError::Decode { .. } => "decode",
            FetchError::BatchTooLarge { .. } => "batch_too_large",
            FetchError::WorkerFailed { .. } => "worker_failed",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            FetchError::InvalidTarget { target, .. }
            | FetchError::Transport { target, .. }
            | FetchError::Upstream { target, .. }
            | FetchError::Decode { target, .. } => Some(target),
            FetchError::BatchTooLarge { .. } | FetchError::WorkerFailed { .. } => None,
        }
    }

    /// Validation failures are raised before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FetchError::InvalidTarget { .. } | FetchError::BatchTooLarge { .. }
        )
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(err: tokio::task::JoinError) -> Self {
        FetchError::WorkerFailed {
            message: err.to_string(),
        }
    }
}

/// Outcome of a request at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Admission rejected: global request limit reached")]
    AdmissionRejected,

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error(transparent)]
    Dispatch(#[from] FetchError),

    #[error("Request deadline of {0:?} exceeded")]
    DeadlineExceeded(std::time::Duration),
}

pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests, please try again later";
pub const OPAQUE_FAILURE_MESSAGE: &str = "failed to process batch";

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::AdmissionRejected => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::MalformedBody(_)
            | ServiceError::Dispatch(_)
            | ServiceError::DeadlineExceeded(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Failure detail stays in the logs; callers only learn that the batch failed.
        let message = match self {
            ServiceError::AdmissionRejected => TOO_MANY_REQUESTS_MESSAGE,
            _ => OPAQUE_FAILURE_MESSAGE,
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
