//! Instrument connection configuration.
//!
//! Provides a type-safe description of how to reach one instrument:
//! its network address and whether the connection should be established
//! automatically at startup.
//!
//! # Example
//!
//! ```
//! use benchlink::ConnectionConfig;
//!
//! let config = ConnectionConfig::new("192.168.1.100", 5025).with_auto_connect();
//! assert_eq!(config.endpoint(), "192.168.1.100:5025");
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// ConnectionConfig
// ============================================================================

/// Configuration for a single instrument connection.
///
/// Immutable after the connection is opened; reconnect cycles reuse the
/// same configuration for every attempt.
///
/// Deserializes from the camelCase JSON document used by host environments:
///
/// ```json
/// { "host": "192.168.1.100", "port": 5025, "autoConnect": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Instrument hostname or IP address.
    pub host: String,

    /// Instrument TCP port.
    pub port: u16,

    /// Connect automatically when the connection is opened.
    ///
    /// When set, the reconnection supervisor is armed immediately and the
    /// first attempt starts without an explicit `connect` call.
    #[serde(default)]
    pub auto_connect: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionConfig {
    /// Conventional raw-socket SCPI port.
    pub const DEFAULT_PORT: u16 = 5025;

    /// Creates a configuration for the given host and port.
    ///
    /// Auto-connect is disabled by default.
    #[inline]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auto_connect: false,
        }
    }

    /// Parses a configuration from its JSON document form.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if the parsed values fail validation
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionConfig {
    /// Enables automatic connection at open.
    #[inline]
    #[must_use]
    pub fn with_auto_connect(mut self) -> Self {
        self.auto_connect = true;
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ConnectionConfig {
    /// Returns the `host:port` endpoint string.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the host is empty or the port is zero.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("port must not be zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
