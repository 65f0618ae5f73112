//! Peek-lock message lifecycle.
//!
//! ```text
//!            peek-lock (201)
//!   Unseen ------------------> Locked
//!     ^                          |  |
//!     |  unlock (200) /          |  | delete (200)
//!     |  lock expiry             |  v
//!     +--------------------------+  Deleted
//! ```
//!
//! The authoritative state lives in the service. The client never tracks
//! it; every operation is an attempted transition whose outcome is decided
//! by the response status. This model exists to document and test those
//! transitions, and drives the in-memory emulator.

use std::fmt;
use thiserror::Error;

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;

/// Server-side state of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Available to any receiver
    Unseen,
    /// Invisible to other receivers until deleted, unlocked or expired
    Locked,
    /// Terminal
    Deleted,
}

/// Something that moves a message between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PeekLock,
    Delete,
    Unlock,
    RenewLock,
    LockExpired,
    /// Destructive read, straight from available to gone
    ReceiveAndDelete,
}

/// The event does not apply to the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {event} to a message that is {state}")]
pub struct InvalidTransition {
    pub state: MessageState,
    pub event: LifecycleEvent,
}

impl MessageState {
    /// Apply `event`, returning the next state.
    pub fn apply(self, event: LifecycleEvent) -> Result<MessageState, InvalidTransition> {
        use LifecycleEvent::*;
        use MessageState::*;

        match (self, event) {
            (Unseen, PeekLock) => Ok(Locked),
            (Unseen, ReceiveAndDelete) => Ok(Deleted),
            (Locked, Delete) => Ok(Deleted),
            (Locked, Unlock) => Ok(Unseen),
            (Locked, LockExpired) => Ok(Unseen),
            (Locked, RenewLock) => Ok(Locked),
            (state, event) => Err(InvalidTransition { state, event }),
        }
    }

    pub fn is_available(self) -> bool {
        self == MessageState::Unseen
    }

    pub fn is_terminal(self) -> bool {
        self == MessageState::Deleted
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unseen => write!(f, "unseen"),
            Self::Locked => write!(f, "locked"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeekLock => write!(f, "peek-lock"),
            Self::Delete => write!(f, "delete"),
            Self::Unlock => write!(f, "unlock"),
            Self::RenewLock => write!(f, "renew-lock"),
            Self::LockExpired => write!(f, "lock expiry"),
            Self::ReceiveAndDelete => write!(f, "receive-and-delete"),
        }
    }
}
