//! Error types for the ephemeral store
//!
//! Provides structured error types for every layer: the store drivers,
//! the backend contract and migrator, the entity cache and the codec.

use thiserror::Error;

/// Unified error type for the store
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    Backend {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Backends are not unique: {backends}")]
    DuplicateBackend { backends: String },

    #[error("Counter at {key} holds a non-integer value: {value:?}")]
    InvalidCounter { key: String, value: String },

    // =========================================================================
    // Codec Errors
    // =========================================================================
    #[error("Cannot resolve stored type tag: {type_name}")]
    NameResolution { type_name: String },

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a failed backend operation
    pub fn backend(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::Backend {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retryable by the caller
    ///
    /// This layer never retries on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Configuration(_)
                | Error::DuplicateBackend { .. }
                | Error::NameResolution { .. }
                | Error::InvalidCounter { .. }
                | Error::JsonParse(_)
                | Error::YamlParse(_)
        )
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Backend { .. } | Error::BackendUnavailable { .. } | Error::Io(_)
        )
    }
}

/// Result type alias for the store
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let transient = Error::BackendUnavailable {
            backend: "memory://main".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid expiry".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());

        let dup = Error::DuplicateBackend {
            backends: "memory://a, memory://a".into(),
        };
        assert!(!dup.is_retryable());
    }

    #[test]
    fn test_backend_shorthand() {
        let err = Error::backend("file:///tmp/x", "incr_by", "value is not an integer");
        assert_eq!(
            err.to_string(),
            "Backend operation failed: file:///tmp/x - incr_by: value is not an integer"
        );
        assert!(err.is_transient());
    }
}
