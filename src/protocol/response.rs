//! Response framing and result classification.
//!
//! Instruments stream bytes with no message boundaries; [`ReceiveBuffer`]
//! reassembles the stream into CRLF-delimited lines, and [`classify_line`]
//! turns each line into either an instrument-reported error or a
//! [`QueryValue`].
//!
//! # Classification
//!
//! | Line | Result |
//! |------|--------|
//! | starts with `**ERROR` | [`Error::Protocol`] |
//! | parses fully as a number | [`QueryValue::Number`] |
//! | wrapped in one pair of `"` | [`QueryValue::Text`], quotes stripped |
//! | anything else | [`QueryValue::Text`], verbatim |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Marker prefix of instrument-reported error lines.
pub const ERROR_PREFIX: &str = "**ERROR";

/// Inbound line delimiter.
const LINE_DELIMITER: &str = "\r\n";

// ============================================================================
// QueryValue
// ============================================================================

/// The value carried by one resolving query response line.
///
/// A query resolves with exactly one of these; callers that expect a
/// particular shape use [`as_f64`](Self::as_f64) / [`as_str`](Self::as_str).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// A line that parsed fully as a numeric literal.
    Number(f64),
    /// Any other line, with one wrapping pair of double quotes stripped.
    Text(String),
}

impl QueryValue {
    /// Returns the numeric value, if this is a number.
    #[inline]
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    /// Returns the text value, if this is text.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(text) => Some(text),
        }
    }

    /// Returns `true` if this is a numeric result.
    #[inline]
    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(text) => write!(f, "{text}"),
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Classifies one framed response line.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the line carries the instrument error
/// marker. Protocol errors are never query results; while a query is
/// outstanding the machine logs them and keeps waiting for the next line.
pub fn classify_line(line: &str) -> Result<QueryValue> {
    if line.starts_with(ERROR_PREFIX) {
        return Err(Error::protocol(line));
    }

    if let Ok(number) = line.parse::<f64>() {
        return Ok(QueryValue::Number(number));
    }

    let text = if line.len() >= 2 && line.starts_with('"') && line.ends_with('"') {
        &line[1..line.len() - 1]
    } else {
        line
    };

    Ok(QueryValue::Text(text.to_string()))
}

// ============================================================================
// ReceiveBuffer
// ============================================================================

/// Accumulates streamed bytes and splits off complete CRLF lines.
///
/// Reassembly is order-preserving and boundary-insensitive: the chunking of
/// the byte stream has no effect on the lines produced. The buffer is owned
/// by the state machine and cleared on every state transition, so partial
/// data never leaks across connection attempts.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    /// Decoded bytes not yet resolved into a full line.
    acc: String,
}

impl ReceiveBuffer {
    /// Creates an empty buffer.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes, decoding them as UTF-8 lossily.
    pub fn push(&mut self, bytes: &[u8]) {
        self.acc.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Splits off the next complete line, without its CRLF terminator.
    ///
    /// Returns `None` when no full line has been accumulated yet.
    pub fn next_line(&mut self) -> Option<String> {
        let index = self.acc.find(LINE_DELIMITER)?;
        let line = self.acc[..index].to_string();
        self.acc.drain(..index + LINE_DELIMITER.len());
        Some(line)
    }

    /// Discards all accumulated data.
    #[inline]
    pub fn clear(&mut self) {
        self.acc.clear();
    }

    /// Returns the bytes accumulated but not yet framed into a line.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.acc
    }

    /// Returns `true` if nothing is buffered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.acc.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
