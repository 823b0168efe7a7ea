//! Error types for the tern Electrum client.

use std::time::Duration;

use derive_more::{Debug, Display, Error};

use crate::ErrorClass;

/// Convenience alias for results carrying a [`TernError`].
pub type TernResult<T> = Result<T, TernError>;

/// Error type shared by every tern crate.
///
/// Errors are `Clone` so that a single failure can be fanned out to every
/// caller waiting on a coalesced request.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[error(ignore)]
pub enum TernError {
    /// The address could not be decoded for the requested network.
    #[display("invalid address {address}: {reason}")]
    InvalidAddress {
        /// The offending input.
        address: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The connect budget was exhausted without a usable server.
    #[display("no server available after trying {tried} servers in {elapsed:?}")]
    NoServerAvailable {
        /// Number of distinct servers attempted.
        tried: usize,
        /// Time spent searching.
        elapsed: Duration,
    },

    /// A single request did not complete in time.
    #[display("request {method} timed out after {timeout:?}")]
    RequestTimeout {
        /// The JSON-RPC method.
        method: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A batch did not complete in time.
    #[display("batch of {count} requests timed out after {timeout:?}")]
    BatchTimeout {
        /// Number of requests in the batch.
        count: usize,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The server sent something malformed or unexpected.
    #[display("protocol error: {_0}")]
    Protocol(String),

    /// The server answered with a JSON-RPC error object.
    #[display("server error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the server.
        message: String,
    },

    /// A circuit breaker rejected the call without attempting it.
    #[display("circuit open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Remaining cooldown before a probe is allowed.
        retry_after: Duration,
    },

    /// The socket closed while the request was in flight or queued.
    #[display("connection lost: {server}")]
    ConnectionLost {
        /// The server that went away.
        server: String,
    },

    /// The request was the oldest queued entry and was dropped to bound memory.
    #[display("request queue overflow")]
    QueueOverflow,

    /// No connection is currently established.
    #[display("not connected")]
    NotConnected,

    /// Dialing or negotiating with a specific server failed.
    #[display("connection to {server} failed ({class}): {message}")]
    Connection {
        /// `host:port` of the server.
        server: String,
        /// Failure classification.
        class: ErrorClass,
        /// Underlying error message.
        message: String,
    },

    /// The persistence collaborator failed.
    #[display("storage error: {_0}")]
    Storage(String),

    /// Internal error.
    #[display("internal error: {_0}")]
    Internal(String),
}

impl TernError {
    /// Whether the failure is connection-shaped and worth one retry against
    /// a different server.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::BatchTimeout { .. }
                | Self::Protocol(_)
                | Self::ConnectionLost { .. }
                | Self::NotConnected
                | Self::Connection { .. }
        )
    }

    /// Whether the failure means "could not reach the network" rather than
    /// an answer from a server.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::NoServerAvailable { .. }
                | Self::RequestTimeout { .. }
                | Self::BatchTimeout { .. }
                | Self::CircuitOpen { .. }
                | Self::ConnectionLost { .. }
                | Self::NotConnected
                | Self::Connection { .. }
        )
    }

    /// Classification used when recording this failure against a server.
    #[must_use]
    pub const fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Self::RequestTimeout { .. } | Self::BatchTimeout { .. } => Some(ErrorClass::Timeout),
            Self::Protocol(_) => Some(ErrorClass::ProtocolError),
            Self::Server { .. } => Some(ErrorClass::ServerError),
            Self::ConnectionLost { .. } | Self::NotConnected => Some(ErrorClass::ConnectionReset),
            Self::Connection { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Build a [`TernError::Connection`] from an I/O error.
    #[must_use]
    pub fn from_io(server: &str, err: &std::io::Error) -> Self {
        Self::Connection {
            server: server.to_string(),
            class: ErrorClass::classify_io(err),
            message: err.to_string(),
        }
    }
}
