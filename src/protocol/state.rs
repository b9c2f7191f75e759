use std::fmt;

use crate::core::{Error, Result};

/// Lifecycle of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Non-blocking connect in progress
    Connecting,
    /// Transport established, handshake not started
    Connected,
    /// Handshake sent or being verified
    AuthPending,
    /// Handshake complete, commands may flow
    AuthOk,
    /// Transport failed
    Broken,
    /// Waiting to be reaped
    Delete,
}

impl ConnState {
    /// Whether the edge `self -> next` is part of the state machine
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        match (self, next) {
            (Connecting, Connected) | (Connected, AuthPending) | (AuthPending, AuthOk) => true,
            (Broken, Delete) | (AuthOk, Delete) => true,
            // reconnect of an outbound connection
            (Broken, Connecting) => true,
            // refused handshake
            (AuthPending, Delete) => true,
            (Delete, _) => false,
            (_, Broken) => self != Broken,
            _ => false,
        }
    }

    /// Validated transition
    pub fn transition(&mut self, next: ConnState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "Invalid connection transition {} -> {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    /// Whether the connection still takes part in I/O
    pub fn is_live(self) -> bool {
        !matches!(self, ConnState::Broken | ConnState::Delete)
    }

    pub fn is_authenticated(self) -> bool {
        self == ConnState::AuthOk
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::AuthPending => "AUTH_PENDING",
            ConnState::AuthOk => "AUTH_OK",
            ConnState::Broken => "BROKEN",
            ConnState::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
