use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::services::keys::KeyRejection;

/// Failures raised by a blob-store backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("malformed list cursor `{0}`")]
    InvalidCursor(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Error taxonomy of the object lifecycle core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid key `{key}`: {reason}")]
    InvalidKey { key: String, reason: KeyRejection },
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("target `{0}` already exists")]
    TargetExists(String),
    #[error("folder `{0}` is not empty")]
    FolderNotEmpty(String),
    #[error("invalid list cursor `{0}`")]
    InvalidCursor(String),
    #[error("version conflict on `{document}`: held version {held}, stored version {current}")]
    VersionConflict {
        document: String,
        held: u64,
        current: u64,
    },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StorageError),
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidCursor(cursor) => CoreError::InvalidCursor(cursor),
            other => CoreError::StoreUnavailable(other),
        }
    }
}

impl CoreError {
    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::VersionConflict { .. } | CoreError::StoreUnavailable(_)
        )
    }

    pub fn invalid_key(key: impl Into<String>, reason: KeyRejection) -> Self {
        CoreError::InvalidKey {
            key: key.into(),
            reason,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::InvalidKey { .. } | CoreError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::TargetExists(_)
            | CoreError::FolderNotEmpty(_)
            | CoreError::VersionConflict { .. } => StatusCode::CONFLICT,
            CoreError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
