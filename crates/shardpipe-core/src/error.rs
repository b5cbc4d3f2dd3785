//! Error types for shardpipe.

use thiserror::Error;

/// Result type alias using shardpipe's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for shardpipe operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid pipeline configuration (bad split count, missing table, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checksum algorithm does not support the source or target engine
    #[error("Unsupported database type: {0}")]
    UnsupportedDatabaseType(String),

    /// Duplicate job id or a concurrent check attempt
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Reader/writer/apply failure while a job is running
    #[error("Execution error: {0}")]
    Execution(String),

    /// Operation on an unknown job, work unit, or sink
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("split count must be positive".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: split count must be positive"
        );

        let err = Error::Conflict("check already in progress".into());
        assert_eq!(err.to_string(), "Conflict: check already in progress");
    }

    #[test]
    fn test_serde_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
