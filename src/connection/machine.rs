//! The connection state machine.
//!
//! One task owns the whole connection: the socket handle, the pending
//! operation slot, the receive buffer, and both timers. Public API calls and
//! transport events enter as messages and are dispatched strictly one at a
//! time against `(current state, event)`, so no locking guards any of it.
//!
//! The authoritative transition table:
//!
//! | State | Event | Effect | Next |
//! |-------|-------|--------|------|
//! | Disconnected | connect | open socket | Connecting |
//! | Disconnected | disconnect | resolve success | Disconnected |
//! | Connecting | socket connected | — | Connected |
//! | Connecting | disconnect | store responder | Disconnecting |
//! | Connecting | socket close | release socket | Disconnected |
//! | Disconnecting | socket connected (late) | destroy socket | Disconnecting |
//! | Disconnecting | socket end | — | Disconnecting |
//! | Disconnecting | socket close | release, resolve stored responder | Disconnected |
//! | Connected | connect | resolve success, no new socket | Connected |
//! | Connected | disconnect | store responder, destroy socket | Disconnecting |
//! | Connected | socket close | release socket | Disconnected |
//! | Connected | execute command | write line | ExecutingCommand |
//! | Connected | execute query | write line, arm timeout | ExecutingQuery |
//! | Connected | socket data | frame and log lines | Connected |
//! | ExecutingCommand | write flushed | resolve success | Connected |
//! | ExecutingCommand | disconnect | interrupt pending, destroy socket | Disconnecting |
//! | ExecutingCommand | socket close | interrupt pending, release socket | Disconnected |
//! | ExecutingQuery | socket data | resolve on first non-error line | Connected |
//! | ExecutingQuery | query timeout | resolve pending with timeout | Connected |
//! | ExecutingQuery | disconnect | disarm timer, interrupt, destroy | Disconnecting |
//! | ExecutingQuery | socket close | disarm timer, interrupt, release | Disconnected |
//!
//! Anything else is logged as unhandled and, when the event carries a
//! responder, rejected with an invalid-state error.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, Interval};
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::identifiers::SocketGeneration;
use crate::protocol::{classify_line, QueryValue, ReceiveBuffer};
use crate::transport::{SocketHandle, TransportEvent};

use super::state::{ConnectionState, StateCell};

// ============================================================================
// Constants
// ============================================================================

/// Interval between reconnection attempts while idle-disconnected.
pub(crate) const RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// Maximum time a query waits for a resolving response line.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_millis(3000);

// ============================================================================
// Types
// ============================================================================

/// Responder for operations that resolve with no value.
pub(crate) type CommandResponder = oneshot::Sender<Result<()>>;

/// Responder for queries, resolving with the classified value.
pub(crate) type QueryResponder = oneshot::Sender<Result<QueryValue>>;

// ============================================================================
// ApiRequest
// ============================================================================

/// Public API calls, delivered to the machine as events.
pub(crate) enum ApiRequest {
    /// Request transition to connected.
    ///
    /// The responder is absent when the reconnection supervisor or
    /// auto-connect synthesized the request.
    Connect {
        /// Resolved as soon as the request is accepted.
        responder: Option<CommandResponder>,
    },

    /// Request graceful teardown.
    Disconnect {
        /// Resolved once the socket is released.
        responder: CommandResponder,
    },

    /// Write a fire-and-forget command line.
    ExecuteCommand {
        /// Command text, without the newline terminator.
        text: String,
        /// Resolved once the write has flushed.
        responder: CommandResponder,
    },

    /// Write a query line and wait for one resolving response line.
    ExecuteQuery {
        /// Query text, without the newline terminator.
        text: String,
        /// Resolved with the classified response value.
        responder: QueryResponder,
    },

    /// Stop the connection task.
    Shutdown,
}

// ============================================================================
// PendingOperation
// ============================================================================

/// The single outstanding operation, holding the responder captured when it
/// was accepted.
///
/// Resolving consumes the slot, so every operation resolves exactly once.
enum PendingOperation {
    /// A graceful teardown waiting for the socket to close.
    Disconnect {
        /// Responder stored at the disconnect request.
        responder: CommandResponder,
    },

    /// A command waiting for its write to flush.
    Command {
        /// Responder stored at command acceptance.
        responder: CommandResponder,
    },

    /// A query waiting for a resolving response line.
    Query {
        /// Responder stored at query acceptance.
        responder: QueryResponder,
    },
}

impl PendingOperation {
    /// Resolves the operation as interrupted by disconnection.
    fn interrupt(self) {
        match self {
            Self::Disconnect { responder } | Self::Command { responder } => {
                let _ = responder.send(Err(Error::Interrupted));
            }
            Self::Query { responder } => {
                let _ = responder.send(Err(Error::Interrupted));
            }
        }
    }

    /// Resolves the operation at socket release.
    ///
    /// A stored disconnect has completed; a command or query that was still
    /// outstanding when the socket went away was interrupted.
    fn resolve_released(self) {
        match self {
            Self::Disconnect { responder } => {
                let _ = responder.send(Ok(()));
            }
            Self::Command { responder } => {
                let _ = responder.send(Err(Error::Interrupted));
            }
            Self::Query { responder } => {
                let _ = responder.send(Err(Error::Interrupted));
            }
        }
    }
}

// ============================================================================
// Wakeup
// ============================================================================

/// One reason for the machine loop to wake.
enum Wakeup {
    /// A public API request, or `None` when every handle is gone.
    Api(Option<ApiRequest>),
    /// A socket lifecycle event.
    Transport(TransportEvent),
    /// The outstanding command write flushed (or its socket task ended).
    WriteFlushed(StdResult<Result<()>, RecvError>),
    /// The query timeout expired.
    QueryTimeout,
    /// The reconnection supervisor ticked.
    ReconnectTick,
}

// ============================================================================
// Machine
// ============================================================================

/// The connection state machine task.
///
/// Owns every piece of connection state; see the module docs for the
/// transition table.
pub(crate) struct Machine {
    /// Immutable connection configuration.
    config: ConnectionConfig,
    /// Cached `host:port` for log context.
    endpoint: String,
    /// State mirror and subscription list shared with handles.
    shared: Arc<StateCell>,
    /// Incoming API requests.
    api_rx: mpsc::UnboundedReceiver<ApiRequest>,
    /// Sender handed to each socket task.
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Incoming transport events.
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    /// Authoritative connection state.
    state: ConnectionState,
    /// The single outstanding operation.
    pending: Option<PendingOperation>,
    /// Handle to the current socket attempt.
    socket: Option<SocketHandle>,
    /// Reassembly buffer for inbound bytes.
    recv: ReceiveBuffer,
    /// Flush acknowledgment for the outstanding command write.
    flush_rx: Option<oneshot::Receiver<Result<()>>>,
    /// Deadline of the armed query timeout.
    query_deadline: Option<Instant>,
    /// The reconnection supervisor, when armed.
    reconnect: Option<Interval>,
    /// Generation of the most recent socket attempt.
    generation: SocketGeneration,
}

impl Machine {
    /// Creates a machine ready to run.
    pub(crate) fn new(
        config: ConnectionConfig,
        shared: Arc<StateCell>,
        api_rx: mpsc::UnboundedReceiver<ApiRequest>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let endpoint = config.endpoint();

        Self {
            config,
            endpoint,
            shared,
            api_rx,
            transport_tx,
            transport_rx,
            state: ConnectionState::Disconnected,
            pending: None,
            socket: None,
            recv: ReceiveBuffer::new(),
            flush_rx: None,
            query_deadline: None,
            reconnect: None,
            generation: SocketGeneration::initial(),
        }
    }

    /// Runs the machine until shutdown or until every handle is dropped.
    pub(crate) async fn run(mut self) {
        debug!(endpoint = %self.endpoint, "connection task started");

        if self.config.auto_connect {
            self.arm_reconnect();
            self.handle_connect(None);
        }

        loop {
            match self.next_wakeup().await {
                Wakeup::Api(None) | Wakeup::Api(Some(ApiRequest::Shutdown)) => break,
                Wakeup::Api(Some(request)) => self.handle_api(request),
                Wakeup::Transport(event) => self.handle_transport(event),
                Wakeup::WriteFlushed(result) => {
                    self.flush_rx = None;
                    self.handle_write_flushed(result);
                }
                Wakeup::QueryTimeout => self.handle_query_timeout(),
                Wakeup::ReconnectTick => self.handle_reconnect_tick(),
            }
        }

        self.finish();
    }

    /// Waits for the next event from any source.
    async fn next_wakeup(&mut self) -> Wakeup {
        let deadline = self.query_deadline;

        tokio::select! {
            request = self.api_rx.recv() => Wakeup::Api(request),

            Some(event) = self.transport_rx.recv() => Wakeup::Transport(event),

            result = flush_ack(&mut self.flush_rx) => Wakeup::WriteFlushed(result),

            _ = supervisor_tick(&mut self.reconnect) => Wakeup::ReconnectTick,

            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() => Wakeup::QueryTimeout,
        }
    }
}

// ============================================================================
// Machine - API Events
// ============================================================================

impl Machine {
    /// Dispatches one public API request.
    fn handle_api(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::Connect { responder } => {
                info!(endpoint = %self.endpoint, "connect requested");
                let from_api = responder.is_some();
                self.handle_connect(responder);
                // The original arms the supervisor on every caller connect,
                // whatever the machine decided; arming is idempotent.
                if from_api {
                    self.arm_reconnect();
                }
            }

            ApiRequest::Disconnect { responder } => {
                info!(endpoint = %self.endpoint, "disconnect requested");
                self.handle_disconnect(responder);
                self.disarm_reconnect();
            }

            ApiRequest::ExecuteCommand { text, responder } => {
                self.handle_execute_command(text, responder);
            }

            ApiRequest::ExecuteQuery { text, responder } => {
                self.handle_execute_query(text, responder);
            }

            // Intercepted by the run loop.
            ApiRequest::Shutdown => {}
        }
    }

    /// Handles a connect request, synthesized or caller-initiated.
    fn handle_connect(&mut self, responder: Option<CommandResponder>) {
        match self.state {
            ConnectionState::Disconnected => {
                self.generation = self.generation.next();
                let socket = SocketHandle::open(
                    self.generation,
                    self.config.host.clone(),
                    self.config.port,
                    self.transport_tx.clone(),
                );
                self.socket = Some(socket);
                self.set_state(ConnectionState::Connecting, None);
                if let Some(responder) = responder {
                    let _ = responder.send(Ok(()));
                }
            }

            // Attempt already underway or established: accepted, not duplicated.
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Some(responder) = responder {
                    let _ = responder.send(Ok(()));
                }
            }

            state => {
                error!(state = %state, event = "connect", "event not handled in state");
                if let Some(responder) = responder {
                    let _ = responder.send(Err(Error::invalid_state("connect", state)));
                }
            }
        }
    }

    /// Handles a disconnect request.
    fn handle_disconnect(&mut self, responder: CommandResponder) {
        match self.state {
            ConnectionState::Disconnected => {
                let _ = responder.send(Ok(()));
            }

            ConnectionState::Connecting => {
                self.set_state(
                    ConnectionState::Disconnecting,
                    Some(PendingOperation::Disconnect { responder }),
                );
            }

            ConnectionState::Connected => {
                self.set_state(
                    ConnectionState::Disconnecting,
                    Some(PendingOperation::Disconnect { responder }),
                );
                self.destroy_socket();
            }

            ConnectionState::ExecutingCommand => {
                if let Some(pending) = self.pending.take() {
                    pending.interrupt();
                }
                self.set_state(
                    ConnectionState::Disconnecting,
                    Some(PendingOperation::Disconnect { responder }),
                );
                self.destroy_socket();
            }

            ConnectionState::ExecutingQuery => {
                self.query_deadline = None;
                if let Some(pending) = self.pending.take() {
                    pending.interrupt();
                }
                self.set_state(
                    ConnectionState::Disconnecting,
                    Some(PendingOperation::Disconnect { responder }),
                );
                self.destroy_socket();
            }

            state => {
                error!(state = %state, event = "disconnect", "event not handled in state");
                let _ = responder.send(Err(Error::invalid_state("disconnect", state)));
            }
        }
    }

    /// Handles a command request.
    fn handle_execute_command(&mut self, text: String, responder: CommandResponder) {
        match self.state {
            ConnectionState::Connected if self.socket.is_some() => {
                info!(endpoint = %self.endpoint, command = %text, "execute command");
                let (ack_tx, ack_rx) = oneshot::channel();
                if let Some(socket) = &self.socket {
                    socket.write_line(text, Some(ack_tx));
                }
                self.flush_rx = Some(ack_rx);
                self.set_state(
                    ConnectionState::ExecutingCommand,
                    Some(PendingOperation::Command { responder }),
                );
            }

            state => {
                error!(state = %state, event = "execute command", "event not handled in state");
                let _ = responder.send(Err(Error::invalid_state("execute command", state)));
            }
        }
    }

    /// Handles a query request.
    fn handle_execute_query(&mut self, text: String, responder: QueryResponder) {
        match self.state {
            ConnectionState::Connected if self.socket.is_some() => {
                info!(endpoint = %self.endpoint, query = %text, "execute query");
                if let Some(socket) = &self.socket {
                    socket.write_line(text, None);
                }
                self.query_deadline = Some(Instant::now() + QUERY_TIMEOUT);
                self.set_state(
                    ConnectionState::ExecutingQuery,
                    Some(PendingOperation::Query { responder }),
                );
            }

            state => {
                error!(state = %state, event = "execute query", "event not handled in state");
                let _ = responder.send(Err(Error::invalid_state("execute query", state)));
            }
        }
    }
}

// ============================================================================
// Machine - Transport Events
// ============================================================================

impl Machine {
    /// Dispatches one transport event, discarding stale deliveries.
    fn handle_transport(&mut self, event: TransportEvent) {
        let Some(current) = self.socket.as_ref().map(SocketHandle::generation) else {
            trace!(event = event.kind(), "transport event after socket release");
            return;
        };
        if event.generation() != current {
            trace!(
                event = event.kind(),
                generation = %event.generation(),
                "stale transport event"
            );
            return;
        }

        match (self.state, event) {
            (ConnectionState::Connecting, TransportEvent::Connected { .. }) => {
                self.set_state(ConnectionState::Connected, None);
            }

            (ConnectionState::Connecting, TransportEvent::Closed { .. }) => {
                self.cleanup_socket();
            }

            // The socket came up after teardown began; tear it down too.
            (ConnectionState::Disconnecting, TransportEvent::Connected { .. }) => {
                self.destroy_socket();
            }

            (ConnectionState::Disconnecting, TransportEvent::End { .. }) => {}

            (ConnectionState::Disconnecting, TransportEvent::Closed { .. }) => {
                self.cleanup_socket();
            }

            (ConnectionState::Connected, TransportEvent::Closed { .. }) => {
                self.cleanup_socket();
            }

            (ConnectionState::Connected, TransportEvent::Data { bytes, .. }) => {
                self.consume_idle_data(&bytes);
            }

            (ConnectionState::ExecutingCommand, TransportEvent::Closed { .. }) => {
                self.cleanup_socket();
            }

            (ConnectionState::ExecutingQuery, TransportEvent::Data { bytes, .. }) => {
                self.consume_query_data(&bytes);
            }

            (ConnectionState::ExecutingQuery, TransportEvent::Closed { .. }) => {
                self.query_deadline = None;
                self.cleanup_socket();
            }

            // No state reacts to the error itself; the close event that
            // follows drives the transition.
            (state, TransportEvent::Error { error, .. }) => {
                error!(state = %state, %error, "socket error");
            }

            (state, event) => {
                error!(state = %state, event = event.kind(), "event not handled in state");
            }
        }
    }

    /// Frames and logs lines received while no query is outstanding.
    fn consume_idle_data(&mut self, bytes: &[u8]) {
        self.recv.push(bytes);
        while let Some(line) = self.recv.next_line() {
            match classify_line(&line) {
                Err(error) => error!(endpoint = %self.endpoint, %error, "instrument reported error"),
                Ok(_) => warn!(endpoint = %self.endpoint, line = %line, "unexpected line outside query"),
            }
        }
    }

    /// Frames lines while a query is outstanding; the first non-error line
    /// resolves the query.
    fn consume_query_data(&mut self, bytes: &[u8]) {
        self.recv.push(bytes);
        while let Some(line) = self.recv.next_line() {
            match classify_line(&line) {
                // Error lines are logged and skipped; keep waiting.
                Err(error) => {
                    error!(endpoint = %self.endpoint, %error, "instrument reported error during query");
                }
                Ok(value) => {
                    info!(endpoint = %self.endpoint, result = %value, "query result");
                    self.query_deadline = None;
                    if let Some(PendingOperation::Query { responder }) = self.pending.take() {
                        let _ = responder.send(Ok(value));
                    }
                    self.set_state(ConnectionState::Connected, None);
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Machine - Timers
// ============================================================================

impl Machine {
    /// Handles query timeout expiry.
    fn handle_query_timeout(&mut self) {
        self.query_deadline = None;

        if self.state != ConnectionState::ExecutingQuery {
            debug!(state = %self.state, "query timer fired with no query outstanding");
            return;
        }

        error!(endpoint = %self.endpoint, "query timeout");
        if let Some(PendingOperation::Query { responder }) = self.pending.take() {
            let _ = responder.send(Err(Error::timeout(QUERY_TIMEOUT.as_millis() as u64)));
        }
        self.set_state(ConnectionState::Connected, None);
    }

    /// Handles one supervisor tick: retry only while idle-disconnected.
    fn handle_reconnect_tick(&mut self) {
        if self.state == ConnectionState::Disconnected {
            debug!(endpoint = %self.endpoint, "reconnection attempt");
            self.handle_connect(None);
        }
    }

    /// Arms the reconnection supervisor; a second arm is a no-op.
    fn arm_reconnect(&mut self) {
        if self.reconnect.is_none() {
            debug!(endpoint = %self.endpoint, "reconnection supervisor armed");
            self.reconnect = Some(time::interval_at(
                Instant::now() + RECONNECT_INTERVAL,
                RECONNECT_INTERVAL,
            ));
        }
    }

    /// Disarms the reconnection supervisor.
    fn disarm_reconnect(&mut self) {
        if self.reconnect.take().is_some() {
            debug!(endpoint = %self.endpoint, "reconnection supervisor disarmed");
        }
    }
}

// ============================================================================
// Machine - Write Completion
// ============================================================================

impl Machine {
    /// Handles the flush acknowledgment of the outstanding command write.
    fn handle_write_flushed(&mut self, result: StdResult<Result<()>, RecvError>) {
        match (self.state, result) {
            (ConnectionState::ExecutingCommand, Ok(Ok(()))) => {
                if let Some(PendingOperation::Command { responder }) = self.pending.take() {
                    let _ = responder.send(Ok(()));
                }
                self.set_state(ConnectionState::Connected, None);
            }

            // The socket task reports the failure as error + close events,
            // which resolve the pending operation.
            (_, Ok(Err(error))) => {
                warn!(endpoint = %self.endpoint, %error, "command write failed");
            }

            (_, Err(_)) => {
                debug!(endpoint = %self.endpoint, "socket task ended before confirming write");
            }

            (state, Ok(Ok(()))) => {
                trace!(state = %state, "write flushed");
            }
        }
    }
}

// ============================================================================
// Machine - State & Socket Lifecycle
// ============================================================================

impl Machine {
    /// Transitions to a new state.
    ///
    /// Replaces the pending slot, resets the receive buffer, and notifies
    /// observers synchronously.
    fn set_state(&mut self, new: ConnectionState, pending: Option<PendingOperation>) {
        let old = self.state;
        info!(endpoint = %self.endpoint, from = %old, to = %new, "state transition");
        self.state = new;
        self.pending = pending;
        self.recv.clear();
        self.shared.transition(old, new);
    }

    /// Asks the current socket task to drop the stream.
    ///
    /// The resulting close event drives the rest of the teardown.
    fn destroy_socket(&mut self) {
        if let Some(socket) = &self.socket {
            socket.destroy();
        }
    }

    /// Releases the socket after its close event and resolves whatever was
    /// stored in the pending slot.
    fn cleanup_socket(&mut self) {
        self.socket = None;
        self.flush_rx = None;
        if let Some(pending) = self.pending.take() {
            pending.resolve_released();
        }
        self.set_state(ConnectionState::Disconnected, None);
    }

    /// Final cleanup when the task stops.
    fn finish(&mut self) {
        self.disarm_reconnect();
        self.query_deadline = None;
        if let Some(pending) = self.pending.take() {
            pending.interrupt();
        }
        if let Some(socket) = self.socket.take() {
            socket.destroy();
        }
        debug!(endpoint = %self.endpoint, "connection task terminated");
    }
}

// ============================================================================
// Select Helpers
// ============================================================================

/// Awaits the armed flush acknowledgment, or forever when none is armed.
async fn flush_ack(
    slot: &mut Option<oneshot::Receiver<Result<()>>>,
) -> StdResult<Result<()>, RecvError> {
    match slot.as_mut() {
        Some(receiver) => receiver.await,
        None => std::future::pending().await,
    }
}

/// Awaits the armed supervisor tick, or forever when disarmed.
async fn supervisor_tick(slot: &mut Option<Interval>) {
    match slot.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
