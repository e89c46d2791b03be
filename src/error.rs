//! Error handling for Concord Core.
//!
//! This module provides:
//! - Error types with machine-readable codes and internal detail
//! - A `Result` alias used across the crate
//! - Tracing/metrics integration for error reporting
//!
//! Internal control-flow signals (greedy backtracking exhaustion, the
//! patience scheduling deadline) are private to their modules and never
//! surface through these types.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Concord operations.
pub type Result<T> = std::result::Result<T, ConcordError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used programmatically by tooling that
/// inspects agent logs or result files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Problem instance errors (1000-1099)
    RapValidationFailed,
    UnknownAgent,
    UnknownService,
    UnknownNode,
    UnknownResource,

    // Transport errors (2000-2099)
    TransportConnectionFailed,
    TransportSendFailed,
    TransportReceiveFailed,

    // Serialization errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,
    TopologyError,

    // I/O errors (6000-6099)
    IoError,

    // Internal errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Problem instance errors
            Self::RapValidationFailed => 1000,
            Self::UnknownAgent => 1001,
            Self::UnknownService => 1002,
            Self::UnknownNode => 1003,
            Self::UnknownResource => 1004,

            // Transport errors
            Self::TransportConnectionFailed => 2000,
            Self::TransportSendFailed => 2001,
            Self::TransportReceiveFailed => 2002,

            // Serialization errors
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            // Configuration errors
            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,
            Self::TopologyError => 5002,

            // I/O errors
            Self::IoError => 6000,

            // Internal errors
            Self::InternalError => 9000,
        }
    }

    /// Whether an error with this code is fatal for the agent process.
    ///
    /// Configuration and transport failures abort; everything else is
    /// captured in outputs (an empty implementation, a false
    /// `strong_agreement` flag) rather than raised.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RapValidationFailed
                | Self::UnknownAgent
                | Self::UnknownService
                | Self::UnknownNode
                | Self::UnknownResource
                | Self::TransportConnectionFailed
                | Self::TransportSendFailed
                | Self::TransportReceiveFailed
                | Self::ConfigurationError
                | Self::InvalidConfiguration
                | Self::TopologyError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.numeric_code())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for Concord operations.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConcordError {
    /// Machine-readable error code.
    pub code: ErrorCode,

    /// Human-readable message.
    pub message: String,

    /// Internal detail (source error text, offending value), not meant for
    /// end-user display.
    pub internal: Option<String>,
}

impl ConcordError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            internal: None,
        }
    }

    /// Create a new error carrying internal detail.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<String>,
        internal: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            internal: Some(internal.into()),
        }
    }

    /// A configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    /// A problem-instance validation error.
    pub fn rap(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RapValidationFailed, message)
    }

    /// An internal invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Log this error at the appropriate level and bump the error counter.
    pub fn log(&self) {
        counter!("concord_errors_total", "code" => format!("{:?}", self.code)).increment(1);
        if self.code.is_fatal() {
            error!(
                code = %self.code,
                internal = self.internal.as_deref().unwrap_or(""),
                "{}",
                self.message
            );
        } else {
            warn!(
                code = %self.code,
                internal = self.internal.as_deref().unwrap_or(""),
                "{}",
                self.message
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ConcordError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::with_internal(
                ErrorCode::DeserializationError,
                "Failed to deserialize JSON data",
                err.to_string(),
            )
        } else {
            Self::with_internal(
                ErrorCode::SerializationError,
                "Failed to serialize JSON data",
                err.to_string(),
            )
        }
    }
}

impl From<std::io::Error> for ConcordError {
    fn from(err: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::IoError, "I/O operation failed", err.to_string())
    }
}

impl From<config::ConfigError> for ConcordError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            err.to_string(),
        )
    }
}

impl From<redis::RedisError> for ConcordError {
    fn from(err: redis::RedisError) -> Self {
        let code = if err.is_connection_refusal() || err.is_connection_dropped() {
            ErrorCode::TransportConnectionFailed
        } else {
            ErrorCode::TransportSendFailed
        };
        Self::with_internal(code, "Broker operation failed", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_unique() {
        let codes = [
            ErrorCode::RapValidationFailed,
            ErrorCode::UnknownAgent,
            ErrorCode::UnknownService,
            ErrorCode::UnknownNode,
            ErrorCode::UnknownResource,
            ErrorCode::TransportConnectionFailed,
            ErrorCode::TransportSendFailed,
            ErrorCode::TransportReceiveFailed,
            ErrorCode::SerializationError,
            ErrorCode::DeserializationError,
            ErrorCode::ConfigurationError,
            ErrorCode::InvalidConfiguration,
            ErrorCode::TopologyError,
            ErrorCode::IoError,
            ErrorCode::InternalError,
        ];
        let mut numeric: Vec<u32> = codes.iter().map(|c| c.numeric_code()).collect();
        numeric.sort_unstable();
        numeric.dedup();
        assert_eq!(numeric.len(), codes.len());
    }

    #[test]
    fn test_fatality_partition() {
        assert!(ErrorCode::ConfigurationError.is_fatal());
        assert!(ErrorCode::TransportConnectionFailed.is_fatal());
        assert!(!ErrorCode::InternalError.is_fatal());
        assert!(!ErrorCode::SerializationError.is_fatal());
    }

    #[test]
    fn test_with_internal_preserves_detail() {
        let err = ConcordError::with_internal(
            ErrorCode::TopologyError,
            "Topology file is not symmetric",
            "edge a->b missing b->a",
        );
        assert_eq!(err.code, ErrorCode::TopologyError);
        assert!(err.internal.unwrap().contains("a->b"));
    }
}
