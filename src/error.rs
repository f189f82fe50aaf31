use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WaahError>;

/// Error taxonomy for the orchestration core. Not transport-specific; the
/// HTTP layer (`crate::api`) maps each variant to a status code via
/// [`WaahError::status_code`].
#[derive(Error, Debug)]
pub enum WaahError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("wrong state: {0}")]
    WrongState(String),

    #[error("wrong agent: {0}")]
    WrongAgent(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid routing: {0}")]
    InvalidRouting(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("no matching agents")]
    NoMatches,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl WaahError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WaahError::NotFound(_) => StatusCode::NOT_FOUND,
            WaahError::WrongState(_) | WaahError::WrongAgent(_) => StatusCode::CONFLICT,
            WaahError::InvalidIdentity(_) | WaahError::InvalidRouting(_) => {
                StatusCode::BAD_REQUEST
            }
            WaahError::NoMatches => StatusCode::NOT_FOUND,
            WaahError::PersistenceFailure(_)
            | WaahError::Database(_)
            | WaahError::Serialization(_)
            | WaahError::Internal(_)
            | WaahError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WaahError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Timeout is a first-class outcome, not an error: suspending operations
/// return this directly instead of threading it through `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout;
