//! # Repost Common
//!
//! Shared error type, logging configuration and retry helpers for the Repost
//! offline worker crates.
//!
//! ## Features
//!
//! - Application-level error type with categories and backtraces
//! - Logging configuration and setup
//! - Retry and timeout utilities
//! - Result extension traits

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, retry_with_backoff_if, with_timeout, RetryConfig};

/// Application-level error type.
///
/// Library crates keep their own error enums and convert into this one at the
/// binary boundary.
#[derive(Error, Debug)]
pub enum RepostError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker lifecycle errors (install, activate, state transitions).
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl RepostError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error with source.
    pub fn cache_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a lifecycle error.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error with source.
    pub fn lifecycle_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepostError::Network { .. } | RepostError::Timeout(_) | RepostError::Io(_)
        )
    }

    /// Get the error category for logs and reports.
    pub fn category(&self) -> &'static str {
        match self {
            RepostError::Network { .. } => "network",
            RepostError::Cache { .. } => "cache",
            RepostError::Lifecycle { .. } => "lifecycle",
            RepostError::Config { .. } => "config",
            RepostError::Io(_) => "io",
            RepostError::Timeout(_) => "timeout",
            RepostError::NotFound(_) => "not_found",
            RepostError::InvalidArgument(_) => "invalid_argument",
            RepostError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for application-level operations.
pub type Result<T> = std::result::Result<T, RepostError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Convert to a different error type.
    fn map_err_to<E: Into<RepostError>>(self, f: impl FnOnce() -> E) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RepostError::Internal {
            message: format!("{}: {}", message.into(), e),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }

    fn map_err_to<E2: Into<RepostError>>(self, f: impl FnOnce() -> E2) -> Result<T> {
        self.map_err(|_| f().into())
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RepostError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(RepostError::cache("test").category(), "cache");
        assert_eq!(RepostError::network("test").category(), "network");
        assert_eq!(RepostError::lifecycle("test").category(), "lifecycle");
        assert_eq!(
            RepostError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(RepostError::network("test").is_retryable());
        assert!(RepostError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RepostError::cache("test").is_retryable());
        assert!(!RepostError::config("bad origin").is_retryable());
    }

    #[test]
    fn test_context_wraps_source_message() {
        let parsed: std::result::Result<u32, std::num::ParseIntError> = "abc".parse();
        let err = parsed.context("reading version").unwrap_err();
        assert_eq!(err.category(), "internal");
        assert!(err.to_string().contains("reading version"));
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("repost-api-v1"),
            Err(RepostError::NotFound(name)) if name == "repost-api-v1"
        ));
    }
}
