//! Cache-related error types

use thiserror::Error;

/// Cache and backend operation errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Invalid cache key: {key}")]
    InvalidKey { key: String },

    #[error("Database connection error: {message}")]
    Connection { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("No tokio runtime available to run background cache tasks")]
    NoRuntime,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl CacheError {
    pub(crate) fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}

/// Re-export commonly used Result type
pub type Result<T> = std::result::Result<T, CacheError>;
