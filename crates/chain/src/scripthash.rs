//! Electrum script hash derivation.

use std::{num::NonZeroUsize, str::FromStr, thread};

use bitcoin::{Address, address::NetworkUnchecked};
use sha2::{Digest, Sha256};
use tern_types::{Network, TernError, TernResult};

use crate::bitcoin_network;

/// Compute the Electrum script hash of `address` on `network`.
///
/// The locking script is hashed with SHA-256 and the digest is hex-encoded
/// in reversed byte order.
pub fn to_script_hash(address: &str, network: Network) -> TernResult<String> {
    let invalid = |reason: String| TernError::InvalidAddress { address: address.to_string(), reason };

    let unchecked =
        Address::<NetworkUnchecked>::from_str(address.trim()).map_err(|e| invalid(e.to_string()))?;
    let checked =
        unchecked.require_network(bitcoin_network(network)).map_err(|e| invalid(e.to_string()))?;

    let mut digest: [u8; 32] = Sha256::digest(checked.script_pubkey().as_bytes()).into();
    digest.reverse();
    Ok(hex::encode(digest))
}

/// Compute script hashes for many addresses, failing on the first invalid one.
pub fn to_script_hashes<S: AsRef<str>>(addresses: &[S], network: Network) -> TernResult<Vec<String>> {
    addresses.iter().map(|a| to_script_hash(a.as_ref(), network)).collect()
}

/// Like [`to_script_hashes`], spread over scoped OS threads.
pub fn to_script_hashes_parallel<S>(addresses: &[S], network: Network) -> TernResult<Vec<String>>
where
    S: AsRef<str> + Sync,
{
    let workers = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    if addresses.len() < 64 || workers == 1 {
        return to_script_hashes(addresses, network);
    }
    let chunk = addresses.len().div_ceil(workers);

    let chunks: Vec<TernResult<Vec<String>>> = thread::scope(|scope| {
        let handles: Vec<_> = addresses
            .chunks(chunk)
            .map(|part| scope.spawn(move || to_script_hashes(part, network)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(TernError::Internal("script hash worker panicked".to_string()))
                })
            })
            .collect()
    });

    let mut out = Vec::with_capacity(addresses.len());
    for part in chunks {
        out.extend(part?);
    }
    Ok(out)
}

/// Like [`to_script_hashes`], yielding to the runtime between chunks so large
/// wallets do not starve other tasks.
pub async fn to_script_hashes_chunked<S: AsRef<str>>(
    addresses: &[S],
    network: Network,
    chunk_size: usize,
) -> TernResult<Vec<String>> {
    let mut out = Vec::with_capacity(addresses.len());
    for part in addresses.chunks(chunk_size.max(1)) {
        out.extend(to_script_hashes(part, network)?);
        tokio::task::yield_now().await;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const GENESIS_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    const GENESIS_SCRIPT_HASH: &str =
        "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";

    const MAINNET: [&str; 4] = [
        "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
        "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
        "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
        "bc1p5d7rjq7g6rdk2yhzks9smlaqtedr4dekq08ge8ztwac72sfr9rusxg3297",
    ];

    #[test]
    fn test_known_vector() {
        assert_eq!(to_script_hash(GENESIS_ADDRESS, Network::Bitcoin).unwrap(), GENESIS_SCRIPT_HASH);
    }

    #[test]
    fn test_deterministic_and_hex() {
        for address in MAINNET {
            let a = to_script_hash(address, Network::Bitcoin).unwrap();
            let b = to_script_hash(address, Network::Bitcoin).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), 64);
            assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[rstest]
    #[case::garbage("not-an-address", Network::Bitcoin)]
    #[case::empty("", Network::Bitcoin)]
    #[case::wrong_network(GENESIS_ADDRESS, Network::Testnet)]
    #[case::bad_checksum("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb", Network::Bitcoin)]
    fn test_invalid(#[case] address: &str, #[case] network: Network) {
        let err = to_script_hash(address, network).unwrap_err();
        assert!(matches!(err, TernError::InvalidAddress { .. }), "unexpected {err:?}");
    }

    #[test]
    fn test_variants_match_per_item() {
        let addresses: Vec<&str> = MAINNET.iter().copied().cycle().take(200).collect();
        let naive: Vec<String> =
            addresses.iter().map(|a| to_script_hash(a, Network::Bitcoin).unwrap()).collect();

        assert_eq!(to_script_hashes(&addresses, Network::Bitcoin).unwrap(), naive);
        assert_eq!(to_script_hashes_parallel(&addresses, Network::Bitcoin).unwrap(), naive);
    }

    #[tokio::test]
    async fn test_chunked_matches_per_item() {
        let addresses: Vec<String> = MAINNET.iter().map(|s| s.to_string()).collect();
        let naive = to_script_hashes(&addresses, Network::Bitcoin).unwrap();
        let chunked = to_script_hashes_chunked(&addresses, Network::Bitcoin, 3).await.unwrap();
        assert_eq!(chunked, naive);
    }

    #[test]
    fn test_batch_fails_on_invalid() {
        let addresses = [GENESIS_ADDRESS, "nope"];
        assert!(to_script_hashes(&addresses, Network::Bitcoin).is_err());
    }
}
