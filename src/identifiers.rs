//! Type-safe identifiers for connection entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use uuid::Uuid;

// ============================================================================
// SubscriptionId
// ============================================================================

/// Identifier for a state-change subscription.
///
/// Returned by [`Connection::on_state_change`](crate::Connection::on_state_change)
/// and accepted by
/// [`Connection::remove_state_listener`](crate::Connection::remove_state_listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generates a new unique subscription ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SocketGeneration
// ============================================================================

/// Monotonic counter identifying one socket attempt.
///
/// Every transport event carries the generation of the socket that produced
/// it; the state machine discards events from generations it has released,
/// so a stale socket can never deliver data into a newer connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SocketGeneration(u64);

impl SocketGeneration {
    /// The generation before any socket has been opened.
    #[inline]
    pub(crate) const fn initial() -> Self {
        Self(0)
    }

    /// Returns the generation for the next socket attempt.
    #[inline]
    #[must_use]
    pub(crate) const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SocketGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
