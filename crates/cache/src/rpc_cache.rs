//! Electrum-aware cache with per-method policies.

use std::{collections::HashMap, time::Duration};

use derive_more::Debug;
use serde_json::Value;
use tern_rpc::methods;

use crate::MemoryCache;

/// Default lifetime of cached address and fee queries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default number of cached responses.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Very long TTL for immutable data (100 years).
const IMMUTABLE_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cache policy for an Electrum method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never cache this method.
    NoCache,
    /// Cache with a specific TTL.
    Ttl(Duration),
    /// Cache until evicted by LRU.
    Immutable,
}

/// Method-aware response cache.
///
/// Keys are `{method}:{params_json}`. Methods without an explicit policy are
/// cached for the default TTL when they are read-only queries and never
/// otherwise.
#[derive(Debug)]
pub struct RpcCache {
    inner: MemoryCache,
    policies: HashMap<&'static str, CachePolicy>,
    ttl: Duration,
}

impl Default for RpcCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl RpcCache {
    /// Create a cache holding up to `capacity` responses for `ttl`.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let mut policies = HashMap::new();
        // A transaction never changes once it exists.
        policies.insert(methods::TRANSACTION_GET, CachePolicy::Immutable);
        policies.insert(methods::TRANSACTION_BROADCAST, CachePolicy::NoCache);
        policies.insert(methods::SCRIPTHASH_SUBSCRIBE, CachePolicy::NoCache);
        policies.insert(methods::HEADERS_SUBSCRIBE, CachePolicy::NoCache);
        Self { inner: MemoryCache::new(capacity), policies, ttl }
    }

    /// Override the policy of one method.
    #[must_use]
    pub fn with_policy(mut self, method: &'static str, policy: CachePolicy) -> Self {
        self.policies.insert(method, policy);
        self
    }

    /// The TTL applied to [`CachePolicy::Ttl`] defaults.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Policy for `method`.
    #[must_use]
    pub fn policy(&self, method: &str) -> CachePolicy {
        match self.policies.get(method) {
            Some(policy) => *policy,
            None if methods::is_cacheable(method) => CachePolicy::Ttl(self.ttl),
            None => CachePolicy::NoCache,
        }
    }

    /// Cached response for a request, if any.
    pub fn get(&self, method: &str, params: &[Value]) -> Option<Value> {
        if self.policy(method) == CachePolicy::NoCache {
            return None;
        }
        let hit = self.inner.get(&Self::cache_key(method, params));
        crate::metrics::record_cache_access(hit.is_some());
        hit
    }

    /// Store a response. Does nothing for uncached methods.
    pub fn put(&self, method: &str, params: &[Value], value: Value) {
        let ttl = match self.policy(method) {
            CachePolicy::NoCache => return,
            CachePolicy::Ttl(ttl) => ttl,
            CachePolicy::Immutable => IMMUTABLE_TTL,
        };
        self.inner.put(&Self::cache_key(method, params), value, ttl);
    }

    /// Forget one response.
    pub fn invalidate(&self, method: &str, params: &[Value]) {
        self.inner.delete(&Self::cache_key(method, params));
    }

    /// Forget every response whose parameters include the string `param`,
    /// e.g. everything about one script hash after its status changed.
    pub fn invalidate_param(&self, param: &str) -> usize {
        let needle = Value::String(param.to_string()).to_string();
        self.inner.delete_matching(|key| {
            key.split_once(':').is_some_and(|(_, params)| params.contains(&needle))
        })
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// The cache key of a request.
    #[must_use]
    pub fn cache_key(method: &str, params: &[Value]) -> String {
        let params_json = serde_json::to_string(params).unwrap_or_else(|_| "[]".to_string());
        format!("{method}:{params_json}")
    }
}
