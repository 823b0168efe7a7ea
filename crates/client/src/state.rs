//! Connection lifecycle state machine and reconnect backoff.

use std::time::Duration;

use derive_more::Display;

/// Lifecycle state of a [`ProtocolClient`](crate::ProtocolClient).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket.
    #[display("disconnected")]
    Disconnected,
    /// Dialing candidate servers.
    #[display("connecting")]
    Connecting,
    /// A socket is open and `server.version` / the tip check are running.
    #[display("handshaking")]
    Handshaking,
    /// Requests may be issued.
    #[display("ready")]
    Ready,
    /// Closing gracefully; in-flight requests may still complete.
    #[display("draining")]
    Draining,
    /// The last connect or connection failed.
    #[display("error")]
    Error,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Handshaking | Error | Disconnected)
                | (Handshaking, Ready | Error | Disconnected)
                | (Ready, Draining | Error | Disconnected)
                | (Draining, Disconnected | Error)
                | (Error, Disconnected | Error)
        )
    }

    /// Whether requests may be sent.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Validated connection state holder.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a state machine in [`ConnectionState::Disconnected`].
    #[must_use]
    pub const fn new() -> Self {
        Self { state: ConnectionState::Disconnected }
    }

    /// Get the current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// Rejected transitions are logged and leave the state unchanged.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            trace!(from = %self.state, to = %next, "connection state");
            self.state = next;
            true
        } else {
            warn!(from = %self.state, to = %next, "rejected connection state transition");
            false
        }
    }

    /// Walk back to [`ConnectionState::Disconnected`] from wherever we are,
    /// passing through the states the table requires.
    pub fn reset(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Ready => {
                self.transition(ConnectionState::Draining);
                self.transition(ConnectionState::Disconnected);
            }
            _ => {
                self.transition(ConnectionState::Disconnected);
            }
        }
    }
}

/// Exponential backoff for automatic reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            max_attempts: 5,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the zero-based `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt)).min(self.max_delay)
    }
}
