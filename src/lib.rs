//! Benchlink - Async client for line-oriented benchtop instruments.
//!
//! This library maintains a single persistent TCP connection to a
//! SCPI-style instrument and exposes two request kinds: fire-and-forget
//! commands and single-value queries, with automatic reconnection, timeout
//! protection, and response classification.
//!
//! # Architecture
//!
//! The connection follows a client model:
//!
//! - **Handle (caller side)**: cheap to clone, delivers requests as messages
//! - **Machine task**: the connection state machine; owns the socket
//!   lifecycle, the pending operation, the receive buffer, and both timers
//! - **Socket task**: one per connection attempt, translating raw socket
//!   events into uniform transport events
//!
//! Key design principles:
//!
//! - Each [`Connection`] owns: machine task + socket task + subscription list
//! - All events are dispatched strictly serialized against `(state, event)`
//! - At most one caller-visible operation in flight, enforced structurally
//! - Connectivity failures never abort the process; the reconnection
//!   supervisor retries until a caller disconnects
//!
//! # Quick Start
//!
//! ```no_run
//! use benchlink::{Connection, ConnectionConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Describe the instrument endpoint
//!     let config = ConnectionConfig::new("192.168.1.100", 5025).with_auto_connect();
//!     let connection = Connection::open(config)?;
//!
//!     connection.connect().await?;
//!
//!     // Fire-and-forget command, then a single-value query
//!     connection.execute_command("INST:SEL CH1").await?;
//!     let voltage = connection.execute_query("MEAS:VOLT?").await?;
//!     println!("voltage: {voltage}");
//!
//!     connection.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Connection configuration |
//! | [`connection`] | Connection handle and state machine |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Response framing and classification |
//!
//! # Wire Protocol
//!
//! - Outbound: `<command-or-query-text>` + `\n`
//! - Inbound: lines terminated by `\r\n`; lines beginning with `**ERROR`
//!   are instrument-reported errors, every other line is a query result
//! - Results: full-string numeric literals become numbers; a line wrapped
//!   in one pair of double quotes becomes the unwrapped string; anything
//!   else is the raw string

// ============================================================================
// Modules
// ============================================================================

/// Connection configuration.
///
/// Use [`ConnectionConfig::new`] or [`ConnectionConfig::from_json`] to
/// describe an instrument endpoint.
pub mod config;

/// Connection handle and state machine.
///
/// This module contains the core types:
///
/// - [`Connection`] - handle to one instrument connection
/// - [`ConnectionState`] - the machine's lifecycle state
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connection entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Response framing and classification.
///
/// Internal framing lives here along with the public [`QueryValue`] type.
pub mod protocol;

/// TCP transport layer.
///
/// Internal module owning the raw socket underneath the state machine.
mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration types
pub use config::ConnectionConfig;

// Connection types
pub use connection::{Connection, ConnectionState, StateChangeHandler};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::SubscriptionId;

// Protocol types
pub use protocol::{QueryValue, ERROR_PREFIX};
