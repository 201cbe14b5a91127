//! Connection states and state-change broadcasting.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::identifiers::SubscriptionId;

// ============================================================================
// ConnectionState
// ============================================================================

/// The connection's lifecycle state.
///
/// Exactly one value at any instant; all transitions happen on the
/// connection task, so observers never see a partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket; the reconnection supervisor may retry from here.
    Disconnected,
    /// A socket attempt is in flight.
    Connecting,
    /// Graceful teardown; waiting for the socket to close.
    Disconnecting,
    /// Idle and ready to accept a command or query.
    Connected,
    /// A command has been written; waiting for the flush confirmation.
    ExecutingCommand,
    /// A query has been written; waiting for a resolving response line.
    ExecutingQuery,
}

impl ConnectionState {
    /// Returns `true` if a socket is established (idle or executing).
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::ExecutingCommand | Self::ExecutingQuery
        )
    }

    /// Returns `true` if a new command or query would be accepted.
    #[inline]
    #[must_use]
    pub fn can_execute(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Disconnecting => "disconnecting",
            Self::Connected => "connected",
            Self::ExecutingCommand => "executing command",
            Self::ExecutingQuery => "executing query",
        };
        f.write_str(name)
    }
}

// ============================================================================
// StateChangeHandler
// ============================================================================

/// State-change observer callback type.
///
/// Called with `(old_state, new_state)` synchronously on every transition.
/// Handlers run on the connection task: keep them fast, and do not call
/// subscription methods from within a handler.
pub type StateChangeHandler = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

// ============================================================================
// StateCell
// ============================================================================

/// Current state mirror plus the subscription list, shared between the
/// connection handle and the machine task.
///
/// The machine is the only writer; handles read the mirror and manage
/// subscriptions.
pub(crate) struct StateCell {
    /// Last state published by the machine.
    current: Mutex<ConnectionState>,
    /// Registered state-change observers.
    listeners: Mutex<FxHashMap<SubscriptionId, StateChangeHandler>>,
}

impl StateCell {
    /// Creates a cell in the disconnected state with no listeners.
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            listeners: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the last published state.
    #[inline]
    pub(crate) fn get(&self) -> ConnectionState {
        *self.current.lock()
    }

    /// Publishes a transition and notifies every listener synchronously.
    pub(crate) fn transition(&self, old: ConnectionState, new: ConnectionState) {
        *self.current.lock() = new;

        let listeners = self.listeners.lock();
        for handler in listeners.values() {
            handler(old, new);
        }
    }

    /// Registers a state-change listener.
    pub(crate) fn subscribe(&self, handler: StateChangeHandler) -> SubscriptionId {
        let id = SubscriptionId::generate();
        self.listeners.lock().insert(id, handler);
        id
    }

    /// Removes a listener; returns `false` if the ID was unknown.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            ConnectionState::ExecutingCommand.to_string(),
            "executing command"
        );
        assert_eq!(ConnectionState::ExecutingQuery.to_string(), "executing query");
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::ExecutingQuery.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connected.can_execute());
        assert!(!ConnectionState::ExecutingCommand.can_execute());
    }

    #[test]
    fn test_cell_starts_disconnected() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_cell_notifies_listeners() {
        let cell = StateCell::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        let id = cell.subscribe(Box::new(move |old, new| {
            seen_clone.lock().push((old, new));
        }));

        cell.transition(ConnectionState::Disconnected, ConnectionState::Connecting);
        cell.transition(ConnectionState::Connecting, ConnectionState::Connected);

        assert_eq!(
            *seen.lock(),
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );
        assert_eq!(cell.get(), ConnectionState::Connected);

        assert!(cell.unsubscribe(id));
        assert!(!cell.unsubscribe(id));

        cell.transition(ConnectionState::Connected, ConnectionState::Disconnected);
        assert_eq!(seen.lock().len(), 2);
    }
}
