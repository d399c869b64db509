//! Error types for Courier services.

use thiserror::Error;

/// Result type alias using the Courier error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Courier services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage failure (SQLite)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Upstream model provider failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this is a conflict error.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Get HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Upstream(_) => 502,
            _ => 500,
        }
    }

    /// Get a stable machine-readable code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Storage(_) => "STORAGE",
            Self::Upstream(_) => "UPSTREAM",
            Self::Internal(_) => "INTERNAL",
            Self::Io(_) => "IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::InvalidInput("test".into()).status_code(), 400);
        assert_eq!(Error::NotFound("test".into()).status_code(), 404);
        assert_eq!(Error::Conflict("test".into()).status_code(), 409);
        assert_eq!(Error::Upstream("test".into()).status_code(), 502);
        assert_eq!(Error::Storage("test".into()).status_code(), 500);
        assert_eq!(Error::Internal("test".into()).status_code(), 500);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Conflict("dup".into()).code(), "CONFLICT");
        assert_eq!(Error::Storage("db".into()).code(), "STORAGE");
    }

    #[test]
    fn test_is_conflict() {
        assert!(Error::Conflict("dup".into()).is_conflict());
        assert!(!Error::Storage("db".into()).is_conflict());
    }
}
