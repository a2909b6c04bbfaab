//! Session state machine

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// TCP + SSH handshake done, credentials not yet accepted
    ConnectedUnauthenticated,
    ConnectedAndAuthorized,
    /// Terminal; the manager was shut down
    Closed,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::ConnectedUnauthenticated | SessionState::ConnectedAndAuthorized
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::ConnectedUnauthenticated => "connected (unauthenticated)",
            SessionState::ConnectedAndAuthorized => "connected",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Validated transitions between [`SessionState`]s.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionState,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            current: SessionState::Disconnected,
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(false)` when already in `next` (nothing to publish).
    pub fn transition(&mut self, next: SessionState) -> Result<bool, InvalidTransition> {
        use SessionState::*;

        if self.current == next {
            return Ok(false);
        }

        let allowed = match (self.current, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (_, Connecting) => true,
            (Connecting, ConnectedUnauthenticated) => true,
            (ConnectedUnauthenticated, ConnectedAndAuthorized) => true,
            (Connecting | ConnectedUnauthenticated | ConnectedAndAuthorized, Disconnected) => true,
            _ => false,
        };

        if !allowed {
            return Err(InvalidTransition {
                from: self.current,
                to: next,
            });
        }

        self.current = next;
        Ok(true)
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
