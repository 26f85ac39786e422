//! Error handling for Cachet.
//!
//! This module provides:
//! - A single error type carrying a machine-readable code and chained sources
//! - Severity levels that drive log levels
//! - Metrics integration for error tracking
//! - Conversions from the backend, serialization and HTTP client errors
//!
//! Most of the cache layer never hands these errors to callers: the manager
//! fails open and logs them instead. They surface from backends, from policy
//! construction and from configuration loading.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Backend Errors (2100-2199)
    BackendUnavailable,
    BackendError,
    LockTimeout,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Policy Errors (4100-4199)
    InvalidPolicy,
    InvalidPattern,

    // Warmup Errors (3000-3099)
    WarmupFailed,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::BackendUnavailable => 2100,
            Self::BackendError => 2101,
            Self::LockTimeout => 2102,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::WarmupFailed => 3000,

            Self::InvalidPolicy => 4100,
            Self::InvalidPattern => 4101,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable | Self::BackendError | Self::LockTimeout | Self::WarmupFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            2100..=2199 => "backend",
            2200..=2299 => "serialization",
            3000..=3099 => "warmup",
            4100..=4199 => "policy",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes (bad policy, bad pattern)
    Low,
    /// Expected operational noise (lock contention, warmup target down)
    Medium,
    /// Data that cannot be encoded or decoded
    High,
    /// The backend is gone or the process is misconfigured
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidPolicy | ErrorCode::InvalidPattern => Self::Low,

            ErrorCode::LockTimeout | ErrorCode::WarmupFailed | ErrorCode::BackendError => {
                Self::Medium
            }

            ErrorCode::SerializationError | ErrorCode::DeserializationError => Self::High,

            ErrorCode::BackendUnavailable
            | ErrorCode::ConfigurationError
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Cachet.
#[derive(Error, Debug)]
pub struct CacheError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short human-readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CacheError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a message and internal detail.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// The backend could not be reached or did not answer in time.
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::BackendUnavailable, "Cache backend unavailable", detail)
    }

    /// The backend answered with an error.
    pub fn backend(detail: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::BackendError, "Cache backend command failed", detail)
    }

    /// Waiting on another caller's regeneration lock ran out of time.
    pub fn lock_timeout(key: &str, waited: std::time::Duration) -> Self {
        Self::with_internal(
            ErrorCode::LockTimeout,
            "Timed out waiting for cache regeneration",
            format!("key '{}' still locked after {:?}", key, waited),
        )
    }

    /// A policy failed validation at construction time.
    pub fn invalid_policy(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidPolicy, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the short message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Whether the failure came from the backend rather than from the data.
    ///
    /// Absence is never an error, so this is how callers tell "not present"
    /// apart from "unreachable".
    pub fn is_backend_failure(&self) -> bool {
        matches!(self.code, ErrorCode::BackendUnavailable | ErrorCode::BackendError)
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Cache error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "Cache error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Cache error"
                );
            }
        }
    }

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "cachet_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_timeout()
            || error.is_io_error()
        {
            Self::unavailable(error.to_string()).with_source(error)
        } else {
            Self::backend(error.to_string()).with_source(error)
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process cached JSON", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            "Warmup request timed out"
        } else if error.is_connect() {
            "Failed to connect to warmup target"
        } else {
            "Warmup request failed"
        };

        Self::with_internal(ErrorCode::WarmupFailed, message, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::unavailable(format!("backend operation timed out: {}", error))
    }
}

impl From<config::ConfigError> for CacheError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::BackendUnavailable.is_retryable());
        assert!(ErrorCode::LockTimeout.is_retryable());
        assert!(!ErrorCode::InvalidPolicy.is_retryable());
        assert!(!ErrorCode::DeserializationError.is_retryable());
    }

    #[test]
    fn test_lock_timeout_error() {
        let err = CacheError::lock_timeout("report", std::time::Duration::from_secs(2));
        assert_eq!(err.code(), ErrorCode::LockTimeout);
        assert_eq!(err.severity(), ErrorSeverity::Medium);
        assert!(err.to_string().contains("key 'report' still locked after 2s"));
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::BackendUnavailable.category(), "backend");
        assert_eq!(ErrorCode::DeserializationError.category(), "serialization");
        assert_eq!(ErrorCode::InvalidPolicy.category(), "policy");
        assert_eq!(ErrorCode::ConfigurationError.category(), "configuration");
    }

    #[test]
    fn test_backend_failure_classification() {
        assert!(CacheError::unavailable("connection refused").is_backend_failure());
        assert!(CacheError::backend("WRONGTYPE").is_backend_failure());
        assert!(!CacheError::invalid_policy("bad").is_backend_failure());
    }

    #[test]
    fn test_display_includes_internal_message() {
        let error = CacheError::unavailable("connect timeout");
        let text = error.to_string();
        assert!(text.contains("BackendUnavailable"));
        assert!(text.contains("connect timeout"));
    }

    #[test]
    fn test_serde_json_error_maps_to_deserialization() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("{not json");
        let error = CacheError::from(parse.unwrap_err());
        assert_eq!(error.code(), ErrorCode::DeserializationError);
        assert_eq!(error.severity(), ErrorSeverity::High);
    }
}
