use shared::{
    error::{ApiError, ErrorCode},
    protocol::BulkDeleteReport,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Api(ApiError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{}", describe_partial(.0))]
    PartialBulkFailure(BulkDeleteReport),
    #[error("invalid payload: {0}")]
    Decode(String),
}

impl SyncError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::Api(ApiError::invalid_argument(message))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Api(err) => err.code,
            SyncError::Transport(_) => ErrorCode::StoreUnavailable,
            SyncError::PartialBulkFailure(_) => ErrorCode::PartialBulkFailure,
            SyncError::Decode(_) => ErrorCode::Internal,
        }
    }

    /// Short text suitable for a transient toast.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Api(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

fn describe_partial(report: &BulkDeleteReport) -> String {
    report
        .error()
        .map(|err| err.message)
        .unwrap_or_else(|| "bulk delete completed".to_string())
}

impl From<ApiError> for SyncError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}
