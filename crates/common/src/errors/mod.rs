//! Error types for kbforge
//!
//! Provides a single error enum shared by every crate with:
//! - Distinct variants for each failure family
//! - Machine-readable error codes
//! - Retryability classification for transient external failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,

    // Resource errors (4xxx)
    KnowledgeBaseNotFound,

    // External service errors (8xxx)
    UpstreamError,
    EmbeddingError,
    EmbeddingTimeout,
    KnowledgeBaseError,
    BackendTimeout,
    QueueError,
    QueueUnavailable,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,

            // Resources (4xxx)
            ErrorCode::KnowledgeBaseNotFound => 4002,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::EmbeddingTimeout => 8003,
            ErrorCode::KnowledgeBaseError => 8004,
            ErrorCode::BackendTimeout => 8005,
            ErrorCode::QueueError => 8006,
            ErrorCode::QueueUnavailable => 8007,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Resource errors
    #[error("Knowledge base not found: {id}")]
    KnowledgeBaseNotFound { id: String },

    // External service errors
    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Knowledge base '{knowledge_base}' failed: {message}")]
    KnowledgeBase {
        knowledge_base: String,
        message: String,
    },

    #[error("Knowledge base '{knowledge_base}' timed out after {timeout_ms}ms")]
    BackendTimeout {
        knowledge_base: String,
        timeout_ms: u64,
    },

    #[error("Queue error: {message}")]
    QueueError { message: String },

    #[error("Queue '{queue}' is unavailable: {reason}")]
    QueueUnavailable { queue: String, reason: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::KnowledgeBaseNotFound { .. } => ErrorCode::KnowledgeBaseNotFound,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::KnowledgeBase { .. } => ErrorCode::KnowledgeBaseError,
            AppError::BackendTimeout { .. } => ErrorCode::BackendTimeout,
            AppError::QueueError { .. } => ErrorCode::QueueError,
            AppError::QueueUnavailable { .. } => ErrorCode::QueueUnavailable,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Transient failures of an external collaborator that may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::EmbeddingError { .. }
                | AppError::EmbeddingTimeout { .. }
                | AppError::BackendTimeout { .. }
                | AppError::QueueError { .. }
                | AppError::HttpClient(_)
        )
    }

    /// True when a queue could not be reached or has been closed
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AppError::QueueUnavailable { .. })
    }

    /// Shorthand for a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        AppError::Configuration {
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::QueueError {
            message: err.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field = err.field_errors().keys().next().map(|f| f.to_string());
        AppError::Validation {
            message: err.to_string(),
            field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::KnowledgeBaseNotFound { id: "test".into() };
        assert_eq!(err.code(), ErrorCode::KnowledgeBaseNotFound);
        assert_eq!(err.code().as_code(), 4002);
        assert_eq!(ErrorCode::ValidationError.as_code(), 1001);
    }

    #[test]
    fn test_unavailable_is_detectable() {
        let err = AppError::QueueUnavailable {
            queue: "compliance-checks".into(),
            reason: "no broker configured".into(),
        };
        assert!(err.is_unavailable());
        assert!(!err.is_retryable());
        assert_eq!(err.code(), ErrorCode::QueueUnavailable);
    }

    #[test]
    fn test_retryable_errors() {
        let err = AppError::BackendTimeout {
            knowledge_base: "kb".into(),
            timeout_ms: 100,
        };
        assert!(err.is_retryable());
        assert!(!AppError::configuration("bad").is_retryable());
    }
}
