//! Failure classification for server connection attempts.

use std::io;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Coarse classification of a failed interaction with a server.
///
/// The class decides how long a server is blacklisted after the failure and
/// whether the failure counts as a hard error when scoring.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Host name could not be resolved.
    #[display("DNS_ERROR")]
    DnsError,
    /// TLS negotiation failed.
    #[display("TLS_ERROR")]
    TlsError,
    /// The attempt or a request timed out.
    #[display("TIMEOUT")]
    Timeout,
    /// The server spoke something other than the expected protocol.
    #[display("PROTOCOL_ERROR")]
    ProtocolError,
    /// The server answered but reported an error or is unfit (e.g. stale tip).
    #[display("SERVER_ERROR")]
    ServerError,
    /// The network or host is unreachable, or the port refused the connection.
    #[display("NETWORK_UNREACHABLE")]
    NetworkUnreachable,
    /// An established connection was reset or closed underneath us.
    #[display("CONNECTION_RESET")]
    ConnectionReset,
}

impl ErrorClass {
    /// All classes, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::DnsError,
        Self::TlsError,
        Self::Timeout,
        Self::ProtocolError,
        Self::ServerError,
        Self::NetworkUnreachable,
        Self::ConnectionReset,
    ];

    /// Multiplier applied to the base blacklist schedule.
    ///
    /// DNS and protocol failures rarely heal within a session, so they are
    /// blacklisted close to permanently; timeouts are usually transient.
    #[must_use]
    pub const fn blacklist_multiplier(self) -> u32 {
        match self {
            Self::DnsError | Self::ProtocolError => 24,
            Self::TlsError => 6,
            Self::ServerError => 2,
            Self::Timeout | Self::NetworkUnreachable | Self::ConnectionReset => 1,
        }
    }

    /// Whether this class is penalised as a hard error when scoring.
    #[must_use]
    pub const fn is_hard(self) -> bool {
        matches!(self, Self::DnsError | Self::TlsError)
    }

    /// Classify an I/O error produced while dialing or talking to a server.
    #[must_use]
    pub fn classify_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::ConnectionReset,
            io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable => {
                Self::NetworkUnreachable
            }
            io::ErrorKind::InvalidData => Self::TlsError,
            _ => Self::classify_message(&err.to_string()),
        }
    }

    /// Classify a free-form error message.
    #[must_use]
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("lookup")
            || lower.contains("dns")
            || lower.contains("name or service not known")
            || lower.contains("nodename nor servname")
            || lower.contains("no such host")
        {
            Self::DnsError
        } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake")
        {
            Self::TlsError
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("unreachable") || lower.contains("refused") {
            Self::NetworkUnreachable
        } else if lower.contains("reset") || lower.contains("broken pipe") || lower.contains("eof")
        {
            Self::ConnectionReset
        } else if lower.contains("json") || lower.contains("parse") || lower.contains("protocol") {
            Self::ProtocolError
        } else {
            Self::ServerError
        }
    }
}
