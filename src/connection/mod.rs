//! Instrument connection: public handle and state machine.
//!
//! This module is the core of the crate. Each [`Connection`] owns:
//!
//! - One machine task (the connection state machine)
//! - One socket task per connection attempt, created and destroyed
//!   repeatedly across reconnect cycles
//! - The state mirror and subscription list shared with handles
//!
//! # Concurrency Model
//!
//! All socket events, timer expirations, and public API calls are delivered
//! to the machine task as messages and processed strictly one at a time.
//! Only one caller-visible operation may be in flight per connection; the
//! state machine enforces this structurally rather than with locks.
//!
//! # Example
//!
//! ```no_run
//! use benchlink::{Connection, ConnectionConfig, Result};
//!
//! # async fn example() -> Result<()> {
//! let config = ConnectionConfig::new("192.168.1.100", 5025);
//! let connection = Connection::open(config)?;
//!
//! connection.connect().await?;
//! connection.execute_command("INST:SEL CH1").await?;
//! let voltage = connection.execute_query("MEAS:VOLT?").await?;
//! println!("voltage: {voltage}");
//!
//! connection.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// The connection state machine task.
mod machine;

/// Connection states and state-change broadcasting.
mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use state::{ConnectionState, StateChangeHandler};

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::protocol::QueryValue;

use machine::{ApiRequest, Machine};
use state::StateCell;

// ============================================================================
// Connection
// ============================================================================

/// Handle to one instrument connection.
///
/// Cloning is cheap; all clones talk to the same machine task. The
/// connection lives until [`shutdown`](Self::shutdown) or until every handle
/// is dropped.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync` and can be shared across tasks. All
/// operations are non-blocking; results are delivered when the machine
/// resolves them.
pub struct Connection {
    /// Channel into the machine task.
    api_tx: mpsc::UnboundedSender<ApiRequest>,
    /// State mirror and subscription list (shared with the machine).
    shared: Arc<StateCell>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            api_tx: self.api_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Connection {
    /// Opens a connection handle and spawns its machine task.
    ///
    /// No socket is dialed yet unless `auto_connect` is set, in which case
    /// the first attempt starts immediately and the reconnection supervisor
    /// is armed.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration fails validation.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let (api_tx, api_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StateCell::new());

        debug!(endpoint = %config.endpoint(), "opening connection");
        let machine = Machine::new(config, Arc::clone(&shared), api_rx);
        tokio::spawn(machine.run());

        Ok(Self { api_tx, shared })
    }

    /// Requests transition to connected and arms the reconnection
    /// supervisor.
    ///
    /// Resolves as soon as the request is accepted: immediately when already
    /// connected or connecting (the attempt is not duplicated), and once the
    /// attempt has started from disconnected. Subscribe with
    /// [`on_state_change`](Self::on_state_change) to observe the moment the
    /// socket comes up.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if requested during teardown or execution
    /// - [`Error::ConnectionClosed`] after shutdown
    pub async fn connect(&self) -> Result<()> {
        let (responder, receiver) = oneshot::channel();
        self.send(ApiRequest::Connect {
            responder: Some(responder),
        })?;
        receiver.await?
    }

    /// Requests graceful teardown and disarms the reconnection supervisor.
    ///
    /// From disconnected this resolves immediately with success and produces
    /// no transport activity. If a command or query is outstanding, it is
    /// resolved with [`Error::Interrupted`] before this call resolves.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a teardown is already in progress
    /// - [`Error::ConnectionClosed`] after shutdown
    pub async fn disconnect(&self) -> Result<()> {
        let (responder, receiver) = oneshot::channel();
        self.send(ApiRequest::Disconnect { responder })?;
        receiver.await?
    }

    /// Executes a fire-and-forget command.
    ///
    /// The text is written with a newline terminator; this resolves once the
    /// transport confirms the write flushed, not merely queued.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the connection is idle-connected
    /// - [`Error::Interrupted`] if disconnection aborts the command
    /// - [`Error::ConnectionClosed`] after shutdown
    pub async fn execute_command(&self, text: impl Into<String>) -> Result<()> {
        let (responder, receiver) = oneshot::channel();
        self.send(ApiRequest::ExecuteCommand {
            text: text.into(),
            responder,
        })?;
        receiver.await?
    }

    /// Executes a query expecting exactly one resolving response line.
    ///
    /// Instrument error lines received while waiting are logged and skipped;
    /// the first non-error line resolves the query as a [`QueryValue`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the connection is idle-connected
    /// - [`Error::Timeout`] if no resolving line arrives in time
    /// - [`Error::Interrupted`] if disconnection aborts the query
    /// - [`Error::ConnectionClosed`] after shutdown
    pub async fn execute_query(&self, text: impl Into<String>) -> Result<QueryValue> {
        let (responder, receiver) = oneshot::channel();
        self.send(ApiRequest::ExecuteQuery {
            text: text.into(),
            responder,
        })?;
        receiver.await?
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.get()
    }

    /// Registers a state-change observer.
    ///
    /// The handler is called with `(old_state, new_state)` synchronously on
    /// every transition, on the connection task. Keep handlers fast and do
    /// not call subscription methods from within one.
    pub fn on_state_change(
        &self,
        handler: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.subscribe(Box::new(handler))
    }

    /// Removes a state-change observer.
    ///
    /// Returns `false` if the subscription was not found.
    pub fn remove_state_listener(&self, id: SubscriptionId) -> bool {
        self.shared.unsubscribe(id)
    }

    /// Disconnects and stops the machine task.
    ///
    /// Timers are cancelled and the socket, if any, is destroyed. Further
    /// calls on any handle resolve with a connection-closed error.
    pub async fn shutdown(&self) {
        let _ = self.disconnect().await;
        let _ = self.api_tx.send(ApiRequest::Shutdown);
    }

    /// Sends one request to the machine task.
    fn send(&self, request: ApiRequest) -> Result<()> {
        self.api_tx
            .send(request)
            .map_err(|_| Error::ConnectionClosed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, timeout};

    use crate::protocol::QueryValue;

    /// Binds a loopback listener standing in for the instrument.
    async fn bind_instrument() -> (TcpListener, ConnectionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        (listener, ConnectionConfig::new("127.0.0.1", port))
    }

    /// Reads one newline-terminated request line from the client.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let count = stream.read(&mut byte).await.expect("read");
            if count == 0 || byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).expect("utf8 request")
    }

    /// Polls until the connection reaches the target state.
    async fn wait_for_state(connection: &Connection, target: ConnectionState) {
        timeout(Duration::from_secs(5), async {
            while connection.state() != target {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for state '{target}', still '{}'",
                connection.state()
            )
        });
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_when_connected() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            stream
        });

        connection.connect().await.expect("first connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        connection.connect().await.expect("second connect");
        assert_eq!(connection.state(), ConnectionState::Connected);

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_command_writes_line_and_resolves_after_flush() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await;
            assert_eq!(request, "OUTP ON");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        connection.execute_command("OUTP ON").await.expect("command");
        assert_eq!(connection.state(), ConnectionState::Connected);

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_resolves_number() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await;
            assert_eq!(request, "MEAS:VOLT?");
            stream.write_all(b"3.3\r\n").await.expect("write");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let value = connection.execute_query("MEAS:VOLT?").await.expect("query");
        assert_eq!(value, QueryValue::Number(3.3));
        assert_eq!(connection.state(), ConnectionState::Connected);

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_resolves_quoted_string() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _request = read_request(&mut stream).await;
            stream.write_all(b"\"3.3\"\r\n").await.expect("write");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let value = connection.execute_query("SYST:MODE?").await.expect("query");
        assert_eq!(value, QueryValue::Text("3.3".to_string()));

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_skips_error_lines() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _request = read_request(&mut stream).await;
            stream
                .write_all(b"**ERROR -113\r\nABC\r\n")
                .await
                .expect("write");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let value = connection.execute_query("SYST:ERR?").await.expect("query");
        assert_eq!(value, QueryValue::Text("ABC".to_string()));

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_reassembles_split_deliveries() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _request = read_request(&mut stream).await;
            stream.write_all(b"12").await.expect("write");
            stream.flush().await.expect("flush");
            sleep(Duration::from_millis(50)).await;
            stream.write_all(b".5\r\n").await.expect("write");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let value = connection.execute_query("MEAS:VOLT?").await.expect("query");
        assert_eq!(value, QueryValue::Number(12.5));

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_rejected_while_disconnected() {
        let (_listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let err = connection
            .execute_command("OUTP ON")
            .await
            .expect_err("command must be rejected");
        assert!(err.is_invalid_state());

        let err = connection
            .execute_query("MEAS:VOLT?")
            .await
            .expect_err("query must be rejected");
        assert!(err.is_invalid_state());

        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlapping_query_rejected() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _request = read_request(&mut stream).await;
            // Delay the reply long enough to observe the overlap rejection.
            sleep(Duration::from_millis(300)).await;
            stream.write_all(b"3.3\r\n").await.expect("write");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let first = connection.clone();
        let outstanding =
            tokio::spawn(async move { first.execute_query("MEAS:VOLT?").await });
        wait_for_state(&connection, ConnectionState::ExecutingQuery).await;

        let err = connection
            .execute_command("OUTP ON")
            .await
            .expect_err("overlap must be rejected");
        assert!(err.is_invalid_state());

        let value = outstanding
            .await
            .expect("join")
            .expect("outstanding query still resolves");
        assert_eq!(value, QueryValue::Number(3.3));

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_timeout_keeps_connection_usable() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            // First query: never reply, forcing the timeout.
            let _first = read_request(&mut stream).await;
            // Second query: reply normally.
            let _second = read_request(&mut stream).await;
            stream.write_all(b"\"OK\"\r\n").await.expect("write");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let err = connection
            .execute_query("MEAS:CURR?")
            .await
            .expect_err("query must time out");
        assert!(err.is_timeout());
        assert_eq!(connection.state(), ConnectionState::Connected);

        let value = connection.execute_query("SYST:ERR?").await.expect("query");
        assert_eq!(value, QueryValue::Text("OK".to_string()));

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_pending_query() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _request = read_request(&mut stream).await;
            // Hold the reply until the client tears the socket down.
            let mut sink = [0u8; 16];
            while stream.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        let querier = connection.clone();
        let outstanding =
            tokio::spawn(async move { querier.execute_query("MEAS:VOLT?").await });
        wait_for_state(&connection, ConnectionState::ExecutingQuery).await;

        connection.disconnect().await.expect("disconnect");

        // The pending query resolves before the disconnect does, so its
        // result is already settled here.
        let result = timeout(Duration::from_millis(100), outstanding)
            .await
            .expect("query settled")
            .expect("join");
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_noop() {
        let (_listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        connection.disconnect().await.expect("disconnect");
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        connection.connect().await.expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        wait_for_state(&connection, ConnectionState::Connected).await;

        // Unexpected remote close: the machine falls back to disconnected,
        // and the armed supervisor retries within one interval.
        drop(stream);
        wait_for_state(&connection, ConnectionState::Disconnected).await;

        let (_retry, _) = timeout(Duration::from_millis(2500), listener.accept())
            .await
            .expect("reconnect attempt within one interval")
            .expect("accept retry");
        wait_for_state(&connection, ConnectionState::Connected).await;

        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_connect_dials_without_connect_call() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config.with_auto_connect()).expect("open");

        let (_stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("auto-connect attempt")
            .expect("accept");
        wait_for_state(&connection, ConnectionState::Connected).await;

        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_state_change_notifications() {
        let (listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let id = connection.on_state_change(move |old, new| {
            seen_clone.lock().push((old, new));
        });

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            stream
        });

        connection.connect().await.expect("connect");
        wait_for_state(&connection, ConnectionState::Connected).await;

        assert_eq!(
            seen.lock()[..2],
            [
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );

        assert!(connection.remove_state_listener(id));
        assert!(!connection.remove_state_listener(id));

        let _stream = server.await.expect("server");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let (_listener, config) = bind_instrument().await;
        let connection = Connection::open(config).expect("open");

        connection.shutdown().await;
        sleep(Duration::from_millis(50)).await;

        let err = connection.connect().await.expect_err("must be closed");
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let result = Connection::open(ConnectionConfig::new("", 5025));
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
