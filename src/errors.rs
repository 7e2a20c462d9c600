use crate::{
    db::transaction::TransactionError, parsers::ParserError,
    services::profile_service::StorageError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Extra detail aimed at API client developers, sent alongside `error`.
    pub developer_message: Option<String>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            developer_message: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn with_developer_message(mut self, msg: impl Into<String>) -> Self {
        self.developer_message = Some(msg.into());
        self
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
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(developer_message) = self.developer_message {
            body["developer_message"] = developer_message.into();
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<ParserError> for AppError {
    fn from(err: ParserError) -> Self {
        let msg = err.to_string();
        AppError::new(err.status(), msg.clone()).with_developer_message(msg)
    }
}

impl From<TransactionError> for AppError {
    fn from(err: TransactionError) -> Self {
        tracing::error!(error = %err, "transaction error");
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ProfileNotFound(_) | StorageError::ImageNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            StorageError::ProfileAlreadyExists(_) => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            StorageError::InvalidUsername { .. } | StorageError::InvalidPatch(_) => {
                AppError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            StorageError::Transaction(inner) => inner.into(),
            other => {
                tracing::error!(error = %other, "storage error");
                AppError::internal(other.to_string())
            }
        }
    }
}
