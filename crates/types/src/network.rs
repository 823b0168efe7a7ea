//! Bitcoin networks served by Electrum servers.

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The chain a wallet and its servers operate on.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet.
    #[default]
    #[display("bitcoin")]
    Bitcoin,
    /// Bitcoin testnet3.
    #[display("testnet")]
    Testnet,
    /// Signet.
    #[display("signet")]
    Signet,
    /// Local regtest.
    #[display("regtest")]
    Regtest,
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Ok(Self::Bitcoin),
            "testnet" | "test" => Ok(Self::Testnet),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::bitcoin("bitcoin", Network::Bitcoin)]
    #[case::mainnet("MAINNET", Network::Bitcoin)]
    #[case::testnet("testnet", Network::Testnet)]
    #[case::signet("signet", Network::Signet)]
    #[case::regtest("regtest", Network::Regtest)]
    fn test_parse(#[case] input: &str, #[case] expected: Network) {
        assert_eq!(input.parse::<Network>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown() {
        assert!("litecoin".parse::<Network>().is_err());
    }
}
