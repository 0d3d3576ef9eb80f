// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for hfcache.
//!
//! Two layers:
//! - [`TaskError`] is the taxonomy returned synchronously by the download task
//!   manager (`enqueue`, `get`, `cancel`).
//! - [`ApiError`] is what the HTTP facade sends back. Every response body is
//!   `{"error": "<message>"}` with the matching status code, which is the shape
//!   the front end already understands.
//!
//! Fetch failures never appear here: they are recorded on the task itself.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use thiserror::Error;

use crate::cache::CacheError;

// =============================================================================
// CORE TAXONOMY
// =============================================================================

/// Errors returned by the download task manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// A required input was missing or empty.
    #[error("{0}")]
    InvalidArgument(String),
    /// No task is registered under this id.
    #[error("Download not found: {0}")]
    NotFound(String),
    /// Unexpected registry or runtime fault. Fatal to the operation only.
    #[error("Internal failure: {0}")]
    Internal(String),
}

// =============================================================================
// HTTP ERRORS
// =============================================================================

/// Generate a short reference code for correlating an internal error with logs.
/// Format: ERR-YYYYMMDD-XXXXXX
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let mut rng = rand::thread_rng();
    let random: String = (0..6).map(|_| chars[rng.gen_range(0..chars.len())]).collect();
    format!("ERR-{}-{}", date, random)
}

/// Error returned from an HTTP handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 400
    BadRequest(String),
    /// 404
    NotFound(String),
    /// 500. The message is already stripped of internal details.
    Internal(String),
}

impl ApiError {
    /// Build an internal error, logging the full details under a reference code.
    pub fn internal(details: impl std::fmt::Display) -> Self {
        let reference = generate_reference_code();
        tracing::error!(reference = %reference, error = %details, "Internal error");
        Self::Internal(format!("Internal error (reference {})", reference))
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the user-facing message.
    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(message) => message,
            ApiError::NotFound(message) => message,
            ApiError::Internal(message) => message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::InvalidArgument(message) => ApiError::BadRequest(message),
            TaskError::NotFound(_) => ApiError::NotFound("Download not found".to_string()),
            TaskError::Internal(details) => ApiError::internal(details),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::RepoNotFound(_) => {
                ApiError::NotFound("Repository not found in cache".to_string())
            }
            ambiguous @ CacheError::AmbiguousRepo { .. } => ApiError::BadRequest(ambiguous.to_string()),
            other => ApiError::internal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_code_format() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), "ERR-20250101-ABCDEF".len());
    }

    #[test]
    fn test_task_error_mapping() {
        let err: ApiError = TaskError::InvalidArgument("repo_id and filename are required".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "repo_id and filename are required");

        let err: ApiError = TaskError::NotFound("abc".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.message(), "Download not found");

        let err: ApiError = TaskError::Internal("registry exploded".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message().contains("registry exploded"));
    }

    #[test]
    fn test_cache_error_mapping() {
        let err: ApiError = CacheError::RepoNotFound("gpt2".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: ApiError = CacheError::AmbiguousRepo {
            key: "gpt2".into(),
            candidates: vec!["datasets--gpt2".into(), "models--gpt2".into()],
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.message().contains("models--gpt2"));
    }
}
