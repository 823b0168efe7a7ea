//! Electrum server descriptors.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Address of an Electrum server.
///
/// The identity of a server is its `host:port` key; the transport flag is
/// part of the descriptor but not of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to wrap the connection in TLS.
    #[serde(rename = "useTls")]
    pub tls: bool,
}

impl ServerDescriptor {
    /// Create a new descriptor.
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self { host: host.into(), port, tls }
    }

    /// Create a TLS descriptor.
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, true)
    }

    /// Create a plain TCP descriptor.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, false)
    }

    /// The identity key, `host:port`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, if self.tls { 's' } else { 't' })
    }
}

/// Parses the Electrum `host:port:s` / `host:port:t` notation.
/// A missing transport suffix means TLS.
impl FromStr for ServerDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, tls) = match s.rsplit_once(':') {
            Some((rest, "s")) => (rest, true),
            Some((rest, "t")) => (rest, false),
            _ => (s, true),
        };
        let (host, port) =
            rest.rsplit_once(':').ok_or_else(|| format!("missing port in server '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in server '{s}'"));
        }
        let port = port.parse::<u16>().map_err(|e| format!("invalid port in server '{s}': {e}"))?;
        Ok(Self::new(host, port, tls))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::tls_suffix("electrum.blockstream.info:50002:s", "electrum.blockstream.info", 50002, true)]
    #[case::tcp_suffix("electrum.blockstream.info:50001:t", "electrum.blockstream.info", 50001, false)]
    #[case::no_suffix("fortress.qtornado.com:443", "fortress.qtornado.com", 443, true)]
    #[case::ip("127.0.0.1:50001:t", "127.0.0.1", 50001, false)]
    fn test_parse(#[case] input: &str, #[case] host: &str, #[case] port: u16, #[case] tls: bool) {
        let server: ServerDescriptor = input.parse().unwrap();
        assert_eq!(server, ServerDescriptor::new(host, port, tls));
    }

    #[rstest]
    #[case::no_port("example.com")]
    #[case::bad_port("example.com:abc:s")]
    #[case::no_host(":50002:s")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(input.parse::<ServerDescriptor>().is_err());
    }

    #[test]
    fn test_key_ignores_transport() {
        let a = ServerDescriptor::tls("h", 1);
        let b = ServerDescriptor::tcp("h", 1);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.to_string(), b.to_string());
    }
}
