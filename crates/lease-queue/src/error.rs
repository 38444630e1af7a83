//! Error types for queue operations.
//!
//! Expected outcomes (empty queue, message already gone, lost lease race) are
//! ordinary return values on the adapter contract and never appear here.

use crate::config::BackendKind;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Storage failure in {backend} backend during {operation}: {message}")]
    Storage {
        backend: BackendKind,
        operation: &'static str,
        message: String,
    },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Queue '{queue_name}' is full (capacity: {capacity})")]
    QueueFull { queue_name: String, capacity: usize },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl QueueError {
    /// Build a storage error for a backend operation
    pub fn storage(
        backend: BackendKind,
        operation: &'static str,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Storage {
            backend,
            operation,
            message: message.to_string(),
        }
    }

    /// Check if error is transient and the caller may retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { .. } => true,
            Self::MessageTooLarge { .. } => false,
            Self::QueueFull { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }
}

/// Errors during envelope and payload encoding/decoding
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stored message '{location}' is corrupt: {message}")]
    Corrupt { location: String, message: String },
}

/// Configuration errors, raised once when settings load or an adapter is built
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration '{key}' for queue '{queue}'")]
    Missing { queue: String, key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Backend '{backend}' is not available: {message}")]
    UnsupportedBackend { backend: BackendKind, message: String },

    #[error("Cannot create queue directory '{path}': {message}")]
    PathNotCreatable { path: String, message: String },
}

/// Validation errors for caller-supplied values
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
