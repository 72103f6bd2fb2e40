//! Error types for the lending server

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Stable error codes carried in every error body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Failure = 1,
    NotAuthorized = 2,
    DbFailure = 3,
    NoSuchBorrow = 4,
    NoCopiesAvailable = 5,
    DuplicateLoan = 6,
    Duplicate = 7,
    BadValue = 8,
    RateLimited = 9,
}

/// Reasons a bearer token or credential was refused.
///
/// The variants are kept apart for logging only: every one of them renders
/// the same `401 unauthenticated` response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("invalid username or password")]
    InvalidCredentials,
}

/// Business-rule rejections of a borrow request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BorrowError {
    #[error("no copies available")]
    NoCopiesAvailable,
    #[error("duplicate active loan")]
    DuplicateActiveLoan,
}

/// Business-rule rejections of a return request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReturnError {
    #[error("active borrow not found")]
    NotFound,
}

/// Failures of the persistence collaborator
#[derive(Error, Debug)]
pub enum StorageError {
    /// The unit of work lost a serialization race and may be retried.
    #[error("serialization conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Persisted state contradicts a lending invariant.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // serialization_failure, deadlock_detected, unique_violation
            if matches!(db.code().as_deref(), Some("40001" | "40P01" | "23505")) {
                return StorageError::Conflict(db.message().to_string());
            }
        }
        StorageError::Database(err)
    }
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Borrow rejected: {0}")]
    Borrow(#[from] BorrowError),

    #[error("Return rejected: {0}")]
    Return(#[from] ReturnError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Storage(err.into())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorCode::RateLimited,
                "too many requests, please try again later".to_string(),
            ),
            AppError::Authentication(reason) => {
                tracing::debug!(%reason, "request unauthenticated");
                (
                    StatusCode::UNAUTHORIZED,
                    ErrorCode::NotAuthorized,
                    "unauthenticated".to_string(),
                )
            }
            AppError::Authorization(msg) => {
                (StatusCode::FORBIDDEN, ErrorCode::NotAuthorized, msg.clone())
            }
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, ErrorCode::BadValue, msg.clone())
            }
            AppError::Borrow(BorrowError::NoCopiesAvailable) => (
                StatusCode::CONFLICT,
                ErrorCode::NoCopiesAvailable,
                "no copies of this title are available".to_string(),
            ),
            AppError::Borrow(BorrowError::DuplicateActiveLoan) => (
                StatusCode::CONFLICT,
                ErrorCode::DuplicateLoan,
                "you already have an active borrow for this title".to_string(),
            ),
            AppError::Return(ReturnError::NotFound) => (
                StatusCode::NOT_FOUND,
                ErrorCode::NoSuchBorrow,
                "active borrow not found for this user".to_string(),
            ),
            AppError::Conflict(msg) => {
                (StatusCode::CONFLICT, ErrorCode::Duplicate, msg.clone())
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {:?}", e);
                let status = if e.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, ErrorCode::DbFailure, "Database error".to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Failure,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        let mut response = (status, body).into_response();
        if let AppError::RateLimited { retry_after: Some(wait) } = &self {
            let secs = wait.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
