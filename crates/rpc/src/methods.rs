//! Electrum method names.

/// Protocol version negotiation; returns `[software, protocol]`.
pub const SERVER_VERSION: &str = "server.version";
/// Server capabilities, including the pruning limit.
pub const SERVER_FEATURES: &str = "server.features";
/// No-op used for keepalive.
pub const SERVER_PING: &str = "server.ping";
/// Subscribe to new tips; returns the current tip.
pub const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
/// Subscribe to a script hash; returns its status.
pub const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
/// Drop a script hash subscription.
pub const SCRIPTHASH_UNSUBSCRIBE: &str = "blockchain.scripthash.unsubscribe";
/// Unspent outputs of a script hash.
pub const SCRIPTHASH_LISTUNSPENT: &str = "blockchain.scripthash.listunspent";
/// Confirmed and mempool history of a script hash.
pub const SCRIPTHASH_GET_HISTORY: &str = "blockchain.scripthash.get_history";
/// Raw (or verbose) transaction by id.
pub const TRANSACTION_GET: &str = "blockchain.transaction.get";
/// Submit a raw transaction.
pub const TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
/// Fee rate in BTC/kB for a confirmation target.
pub const ESTIMATE_FEE: &str = "blockchain.estimatefee";
/// Raw block header by height.
pub const BLOCK_HEADER: &str = "blockchain.block.header";

/// Client name announced in `server.version`.
pub const CLIENT_NAME: &str = concat!("tern/", env!("CARGO_PKG_VERSION"));
/// Protocol version requested in `server.version`.
pub const PROTOCOL_VERSION: &str = "1.4";

/// Whether responses to `method` are safe to cache for a short time.
#[must_use]
pub fn is_cacheable(method: &str) -> bool {
    matches!(
        method,
        SCRIPTHASH_LISTUNSPENT | SCRIPTHASH_GET_HISTORY | TRANSACTION_GET | ESTIMATE_FEE | BLOCK_HEADER
    )
}
