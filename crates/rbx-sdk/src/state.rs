//! Lifecycle of a databox session.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake──▶ Connected ◀──▶ Reloading
//!       ▲                      ▲    │                    │             │
//!       │                      │    └──────failure───────┼─────────────┤
//!       │                      └──reconnect── Suspended ◀┴─transport lost
//!       └──────────── disconnect / close / kick-out (from any state)
//! ```

use crate::error::{ClientError, Result};
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DataboxState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected while a reload session is being built.
    Reloading,
    /// The transport dropped; the replica is frozen until it reconnects.
    Suspended,
}

impl DataboxState {
    /// Check if the transition table allows `self -> next`.
    pub fn can_transition_to(self, next: DataboxState) -> bool {
        use DataboxState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Suspended, Connecting)
                | (Connecting, Connected)
                | (Connecting, Suspended)
                | (Connected, Reloading)
                | (Reloading, Connected)
                | (Connected, Suspended)
                | (Reloading, Suspended)
        )
    }

    /// Check if the session is live on the server.
    pub fn is_connected(self) -> bool {
        matches!(self, DataboxState::Connected | DataboxState::Reloading)
    }
}

impl fmt::Display for DataboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataboxState::Disconnected => "disconnected",
            DataboxState::Connecting => "connecting",
            DataboxState::Connected => "connected",
            DataboxState::Reloading => "reloading",
            DataboxState::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

/// Current state plus the checked transition into the next one.
#[derive(Clone, Debug, Default)]
pub struct StateMachine {
    state: DataboxState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DataboxState {
        self.state
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: DataboxState) -> Result<DataboxState> {
        if !self.state.can_transition_to(next) {
            return Err(ClientError::InvalidState(format!(
                "cannot go from {} to {}",
                self.state, next
            )));
        }
        Ok(std::mem::replace(&mut self.state, next))
    }
}
