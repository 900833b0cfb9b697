use crate::rebalance::session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid config {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Session driver is no longer running")]
    SessionClosed,
}
