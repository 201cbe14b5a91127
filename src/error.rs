//! Error types for the instrument connection.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use benchlink::{Connection, Result};
//!
//! async fn example(connection: &Connection) -> Result<()> {
//!     connection.execute_command("OUTP ON").await?;
//!     let voltage = connection.execute_query("MEAS:VOLT?").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Execution | [`Error::Timeout`], [`Error::Interrupted`], [`Error::InvalidState`] |
//! | Instrument | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

use crate::connection::ConnectionState;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when the connection configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level connection failure.
    ///
    /// Returned when the TCP socket cannot be opened or fails mid-stream.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection handle is no longer backed by a running task.
    ///
    /// Returned when an operation is requested after shutdown.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Query received no resolving response line in time.
    ///
    /// The connection itself remains usable after a query timeout.
    #[error("Query timed out after {timeout_ms}ms")]
    Timeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// A pending command or query was aborted by disconnection.
    ///
    /// Always reported to that operation's caller, never silently dropped.
    #[error("Operation interrupted by disconnect")]
    Interrupted,

    /// An operation was requested while the machine could not service it.
    ///
    /// Returned, for example, when a command is issued while a query is
    /// still outstanding, or before the connection is established.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was rejected.
        operation: &'static str,
        /// The connection state at the time of the request.
        state: ConnectionState,
    },

    // ========================================================================
    // Instrument Errors
    // ========================================================================
    /// An error line reported by the instrument itself.
    ///
    /// Protocol errors are logged and skipped while a query is outstanding;
    /// they never resolve a query on their own.
    #[error("Instrument error: {line}")]
    Protocol {
        /// The raw error line as received, without the CRLF terminator.
        line: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a query timeout error.
    #[inline]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Creates a protocol error from an instrument error line.
    #[inline]
    pub fn protocol(line: impl Into<String>) -> Self {
        Self::Protocol { line: line.into() }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a query timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::ChannelClosed(_)
        )
    }

    /// Returns `true` if this is an invalid state error.
    #[inline]
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry once the connection settles.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Interrupted | Self::InvalidState { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("empty host");
        assert_eq!(err.to_string(), "Configuration error: empty host");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::invalid_state("execute query", ConnectionState::Connecting);
        assert_eq!(err.to_string(), "Cannot execute query while connecting");
    }

    #[test]
    fn test_protocol_display() {
        let err = Error::protocol("**ERROR -113,\"Undefined header\"");
        assert_eq!(
            err.to_string(),
            "Instrument error: **ERROR -113,\"Undefined header\""
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::timeout(3000);
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        let conn_err = Error::connection("test");
        let closed_err = Error::ConnectionClosed;
        let other_err = Error::config("test");

        assert!(conn_err.is_connection_error());
        assert!(closed_err.is_connection_error());
        assert!(!other_err.is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        let timeout_err = Error::timeout(3000);
        let interrupted_err = Error::Interrupted;
        let config_err = Error::config("test");

        assert!(timeout_err.is_recoverable());
        assert!(interrupted_err.is_recoverable());
        assert!(!config_err.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionReset, "reset by peer");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
