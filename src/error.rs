//! Unified application error model and mapping helpers.
//! This module provides a common error enum used at the public API surface
//! (manager, instance API, scheduler queries), along with helper mappers to
//! transport status codes. Internals use `anyhow` and convert at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    NotFound { message: String },
    InvalidArgument { message: String },
    PermissionDenied { message: String },
    FailedPrecondition { message: String },
    Canceled { message: String },
    DeadlineExceeded { message: String },
    Internal { message: String },
}

impl AppError {
    pub fn message(&self) -> &str {
        match self {
            AppError::NotFound { message }
            | AppError::InvalidArgument { message }
            | AppError::PermissionDenied { message }
            | AppError::FailedPrecondition { message }
            | AppError::Canceled { message }
            | AppError::DeadlineExceeded { message }
            | AppError::Internal { message } => message.as_str(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self { AppError::NotFound { message: msg.into() } }
    pub fn invalid<S: Into<String>>(msg: S) -> Self { AppError::InvalidArgument { message: msg.into() } }
    pub fn permission<S: Into<String>>(msg: S) -> Self { AppError::PermissionDenied { message: msg.into() } }
    pub fn precondition<S: Into<String>>(msg: S) -> Self { AppError::FailedPrecondition { message: msg.into() } }
    pub fn canceled<S: Into<String>>(msg: S) -> Self { AppError::Canceled { message: msg.into() } }
    pub fn deadline<S: Into<String>>(msg: S) -> Self { AppError::DeadlineExceeded { message: msg.into() } }
    pub fn internal<S: Into<String>>(msg: S) -> Self { AppError::Internal { message: msg.into() } }

    pub fn code_str(&self) -> &'static str {
        match self {
            AppError::NotFound { .. } => "not_found",
            AppError::InvalidArgument { .. } => "invalid_argument",
            AppError::PermissionDenied { .. } => "permission_denied",
            AppError::FailedPrecondition { .. } => "failed_precondition",
            AppError::Canceled { .. } => "canceled",
            AppError::DeadlineExceeded { .. } => "deadline_exceeded",
            AppError::Internal { .. } => "internal",
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::NotFound { .. } => 404,
            AppError::InvalidArgument { .. } => 400,
            AppError::PermissionDenied { .. } => 403,
            AppError::FailedPrecondition { .. } => 412,
            AppError::Canceled { .. } => 499,
            AppError::DeadlineExceeded { .. } => 504,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Preserve an AppError that bubbled up through anyhow layers.
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(err) => AppError::Internal { message: format!("{err:#}") },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::not_found("missing").http_status(), 404);
        assert_eq!(AppError::invalid("bad cid").http_status(), 400);
        assert_eq!(AppError::permission("no token").http_status(), 403);
        assert_eq!(AppError::precondition("override required").http_status(), 412);
        assert_eq!(AppError::canceled("canceled").http_status(), 499);
        assert_eq!(AppError::deadline("hot pin timeout").http_status(), 504);
        assert_eq!(AppError::internal("boom").http_status(), 500);
    }

    #[test]
    fn anyhow_roundtrip_preserves_kind() {
        let inner: anyhow::Error = AppError::not_found("job j1").into();
        let back: AppError = inner.into();
        assert_eq!(back.code_str(), "not_found");

        let plain: AppError = anyhow::anyhow!("io failed").into();
        assert_eq!(plain.code_str(), "internal");
    }
}
