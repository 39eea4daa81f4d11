use std::time::Duration;

use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    /// Connection refused or dropped; eligible for reconnect backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// The backend rejected the identity. Never retried.
    #[error("authorization rejected: {0}")]
    Authorization(String),
    /// Malformed or empty payload from a collaborator.
    #[error("invalid payload: {0}")]
    Data(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("realtime connection is not established")]
    NotConnected,
    #[error("reconnect gave up after {attempts} failed attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("media session failed: {0}")]
    Media(String),
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

impl RealtimeError {
    pub fn from_api(error: ApiError) -> Self {
        if error.code.is_authorization() {
            RealtimeError::Authorization(error.message)
        } else {
            RealtimeError::Transport(format!("{:?}: {}", error.code, error.message))
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, RealtimeError::Authorization(_))
    }

    /// Whether the reconnect policy may try again after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Transport(_) | RealtimeError::Timeout(_) | RealtimeError::NotConnected
        )
    }
}

impl From<reqwest::Error> for RealtimeError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                return RealtimeError::Authorization(err.to_string());
            }
        }
        if err.is_decode() {
            return RealtimeError::Data(err.to_string());
        }
        RealtimeError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Data(err.to_string())
    }
}
