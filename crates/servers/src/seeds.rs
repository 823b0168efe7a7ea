//! Static seed servers.

use tern_types::{Network, ServerDescriptor};

const MAINNET: &[(&str, u16)] = &[
    ("electrum.blockstream.info", 50002),
    ("fortress.qtornado.com", 443),
    ("electrum.emzy.de", 50002),
    ("electrum.bitaroo.net", 50002),
    ("bitcoin.lukechilds.co", 50002),
    ("electrum.acinq.co", 50002),
    ("ecdsa.net", 110),
    ("electrum.hodlister.co", 50002),
];

const TESTNET: &[(&str, u16)] = &[
    ("electrum.blockstream.info", 60002),
    ("testnet.aranguren.org", 51002),
    ("testnet.qtornado.com", 51002),
];

/// Seed servers for a network. All seeds speak TLS except the local regtest
/// default. Signet has no public seeds; configure servers explicitly.
#[must_use]
pub fn seeds(network: Network) -> Vec<ServerDescriptor> {
    match network {
        Network::Bitcoin => MAINNET.iter().map(|(h, p)| ServerDescriptor::tls(*h, *p)).collect(),
        Network::Testnet => TESTNET.iter().map(|(h, p)| ServerDescriptor::tls(*h, *p)).collect(),
        Network::Signet => Vec::new(),
        Network::Regtest => vec![ServerDescriptor::tcp("127.0.0.1", 50001)],
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_seed_keys_unique() {
        for network in [Network::Bitcoin, Network::Testnet] {
            let list = seeds(network);
            assert!(!list.is_empty());
            let keys: HashSet<_> = list.iter().map(ServerDescriptor::key).collect();
            assert_eq!(keys.len(), list.len());
            assert!(list.iter().all(|s| s.tls));
        }
    }

    #[test]
    fn test_regtest_is_local_tcp() {
        let list = seeds(Network::Regtest);
        assert_eq!(list, vec![ServerDescriptor::tcp("127.0.0.1", 50001)]);
    }
}
