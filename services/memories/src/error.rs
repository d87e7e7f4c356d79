use crate::blob_store::StorageError;
use thiserror::Error;

/// Errors surfaced to callers of the metadata store and the lifecycle manager.
///
/// Failures of best-effort collaborators (blob deletes, the geocoder, the
/// image generator) never appear here; they are logged where they happen.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("blob storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LifecycleError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Short machine readable code used in API error payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Failures of the geocoder or the image generator. Logged, never surfaced
/// to end users, never fatal to the owning operation.
#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("{service} unreachable: {message}")]
    Network { service: &'static str, message: String },

    #[error("{service} answered {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} returned an unreadable response: {message}")]
    Parse { service: &'static str, message: String },

    #[error("{service} did not answer within {seconds}s")]
    Timeout { service: &'static str, seconds: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LifecycleError::validation("title").code(), "VALIDATION_ERROR");
        assert_eq!(LifecycleError::not_found("event").code(), "NOT_FOUND");
        assert_eq!(
            LifecycleError::from(StorageError::Transport("down".into())).code(),
            "STORAGE_ERROR"
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            LifecycleError::not_found("Event 42").to_string(),
            "Event 42 not found"
        );
        assert_eq!(
            LifecycleError::validation("title is required").to_string(),
            "validation failed: title is required"
        );
    }
}
