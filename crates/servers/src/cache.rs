//! The shared server registry.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use derive_more::Debug;
use parking_lot::Mutex;
use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    seq::SliceRandom,
};
use tern_runtime::{SystemClock, TaskSlot};
use tern_traits::{Clock, KeyValueStore};
use tern_types::{ErrorClass, Network, ServerDescriptor, TernError, TernResult};

use crate::{NEUTRAL_SCORE, ServerHealthRecord, SuccessInfo, score, seeds};

/// Key of the persisted health blob.
pub const STORAGE_KEY: &str = "tern.server_health.v1";
/// Delay between the last mutation and the save.
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);
/// A server more than this many blocks behind the best height is stale.
pub const DEFAULT_STALE_LAG: u32 = 2;
/// Every n-th selection explores.
pub const DEFAULT_EXPLORATION_INTERVAL: u64 = 10;
/// Minimum score for the cold-start pick.
pub const DEFAULT_COLD_START_SCORE: f64 = 80.0;
/// A server untried for this long is eligible for exploration.
const DEFAULT_EXPLORATION_IDLE: Duration = Duration::from_secs(60 * 60);

/// Selection and persistence tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCacheConfig {
    /// Blocks a server may trail the best height before it is stale.
    pub stale_lag: u32,
    /// Every n-th selection is an exploration pick. Zero disables.
    pub exploration_interval: u64,
    /// Score the best known server needs for the cold-start pick.
    pub cold_start_score: f64,
    /// How long a server must go untried to be explored.
    pub exploration_idle: Duration,
    /// Save debounce.
    pub persist_debounce: Duration,
}

impl Default for ServerCacheConfig {
    fn default() -> Self {
        Self {
            stale_lag: DEFAULT_STALE_LAG,
            exploration_interval: DEFAULT_EXPLORATION_INTERVAL,
            cold_start_score: DEFAULT_COLD_START_SCORE,
            exploration_idle: DEFAULT_EXPLORATION_IDLE,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
        }
    }
}

/// Builder for [`ServerCache`].
#[derive(Debug)]
pub struct ServerCacheBuilder {
    network: Network,
    seeds: Option<Vec<ServerDescriptor>>,
    config: ServerCacheConfig,
    #[debug(skip)]
    store: Option<Arc<dyn KeyValueStore>>,
    #[debug(skip)]
    clock: Arc<dyn Clock>,
    rng_seed: Option<u64>,
}

impl ServerCacheBuilder {
    /// Start building a cache for `network` with its default seeds.
    #[must_use]
    pub fn new(network: Network) -> Self {
        Self {
            network,
            seeds: None,
            config: ServerCacheConfig::default(),
            store: None,
            clock: Arc::new(SystemClock),
            rng_seed: None,
        }
    }

    /// Replace the seed list.
    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<ServerDescriptor>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    /// Replace the tuning.
    #[must_use]
    pub fn with_config(mut self, config: ServerCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist through `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `clock` for timestamps and blacklist expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make weighted selection reproducible.
    #[must_use]
    pub const fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the cache.
    #[must_use]
    pub fn build(self) -> Arc<ServerCache> {
        let rng = self.rng_seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let mut seed_list = self.seeds.unwrap_or_else(|| seeds(self.network));
        let mut seen = HashSet::new();
        seed_list.retain(|s| seen.insert(s.key()));

        Arc::new_cyclic(|this| ServerCache {
            network: self.network,
            seeds: seed_list,
            config: self.config,
            store: self.store,
            clock: self.clock,
            state: Mutex::new(CacheState { records: HashMap::new(), selections: 0, rng }),
            best_height: AtomicU32::new(0),
            save_slot: TaskSlot::new(),
            this: this.clone(),
        })
    }
}

#[derive(Debug)]
struct CacheState {
    records: HashMap<String, ServerHealthRecord>,
    selections: u64,
    rng: StdRng,
}

/// Shared registry of server health, selection policy and best height.
///
/// All mutation goes through [`record_success`](Self::record_success) and
/// [`record_failure`](Self::record_failure); the lock is never held across
/// an await.
#[derive(Debug)]
pub struct ServerCache {
    network: Network,
    seeds: Vec<ServerDescriptor>,
    config: ServerCacheConfig,
    #[debug(skip)]
    store: Option<Arc<dyn KeyValueStore>>,
    #[debug(skip)]
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    best_height: AtomicU32,
    save_slot: TaskSlot,
    #[debug(skip)]
    this: Weak<Self>,
}

impl ServerCache {
    /// Start building a cache.
    #[must_use]
    pub fn builder(network: Network) -> ServerCacheBuilder {
        ServerCacheBuilder::new(network)
    }

    /// The network served.
    #[must_use]
    pub const fn network(&self) -> Network {
        self.network
    }

    /// The seed list selection draws from.
    #[must_use]
    pub fn seeds(&self) -> &[ServerDescriptor] {
        &self.seeds
    }

    /// The tuning in use.
    #[must_use]
    pub const fn config(&self) -> &ServerCacheConfig {
        &self.config
    }

    /// The clock used for timestamps.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Load persisted records, dropping stale never-successful ones.
    /// A corrupt blob is discarded. Returns the number of records kept.
    pub async fn load(&self) -> TernResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let raw =
            store.get(STORAGE_KEY).await.map_err(|e| TernError::Storage(e.to_string()))?;
        let Some(raw) = raw else {
            return Ok(0);
        };
        let records: Vec<ServerHealthRecord> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "discarding corrupt server cache");
                return Ok(0);
            }
        };

        let now = self.clock.now_ms();
        let (loaded, pruned) = {
            let mut state = self.state.lock();
            let (mut loaded, mut pruned) = (0usize, 0usize);
            for mut record in records {
                if record.should_prune(now) {
                    pruned += 1;
                    continue;
                }
                record.score = score(&record, now);
                state.records.insert(record.key(), record);
                loaded += 1;
            }
            (loaded, pruned)
        };

        debug!(loaded, pruned, "server cache loaded");
        if pruned > 0 {
            self.schedule_save();
        }
        Ok(loaded)
    }

    /// Save now, superseding any pending debounced save.
    pub async fn flush(&self) -> TernResult<()> {
        self.save_slot.cancel();
        self.persist().await
    }

    async fn persist(&self) -> TernResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let blob = {
            let state = self.state.lock();
            let mut records: Vec<&ServerHealthRecord> = state.records.values().collect();
            records.sort_by(|a, b| a.key().cmp(&b.key()));
            serde_json::to_string(&records)
                .map_err(|e| TernError::Internal(format!("serialize server cache: {e}")))?
        };
        store.set(STORAGE_KEY, blob).await.map_err(|e| TernError::Storage(e.to_string()))?;
        trace!("server cache saved");
        Ok(())
    }

    fn schedule_save(&self) {
        if self.store.is_none() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let this = self.this.clone();
        self.save_slot.schedule(self.config.persist_debounce, async move {
            if let Some(cache) = this.upgrade() {
                if let Err(e) = cache.persist().await {
                    warn!(error = %e, "failed to save server cache");
                }
            }
        });
    }

    /// Record a successful connection or request.
    pub fn record_success(&self, server: &ServerDescriptor, info: &SuccessInfo) {
        let now = self.clock.now_ms();
        let new_score = {
            let mut state = self.state.lock();
            let record = state
                .records
                .entry(server.key())
                .or_insert_with(|| ServerHealthRecord::new(server));
            record.record_success(now, info);
            record.score
        };
        trace!(
            server = %server.key(),
            latency_ms = info.latency.as_millis() as u64,
            score = new_score,
            "server success"
        );
        self.schedule_save();
    }

    /// Record a failed attempt and blacklist the server accordingly.
    pub fn record_failure(&self, server: &ServerDescriptor, class: ErrorClass, message: &str) {
        let now = self.clock.now_ms();
        let (consecutive, until) = {
            let mut state = self.state.lock();
            let record = state
                .records
                .entry(server.key())
                .or_insert_with(|| ServerHealthRecord::new(server));
            record.record_failure(now, class);
            (record.consecutive_failures, record.blacklist_until.unwrap_or(now))
        };
        debug!(
            server = %server.key(),
            %class,
            consecutive,
            blacklisted_secs = until.saturating_sub(now) / 1000,
            error = message,
            "server failure"
        );
        self.schedule_save();
    }

    /// Whether `server` is currently blacklisted.
    #[must_use]
    pub fn is_blacklisted(&self, server: &ServerDescriptor) -> bool {
        let now = self.clock.now_ms();
        self.state.lock().records.get(&server.key()).is_some_and(|r| r.is_blacklisted(now))
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn record(&self, server: &ServerDescriptor) -> Option<ServerHealthRecord> {
        self.state.lock().records.get(&server.key()).cloned()
    }

    /// Snapshot of all records, best score first.
    #[must_use]
    pub fn records(&self) -> Vec<ServerHealthRecord> {
        let mut records: Vec<_> = self.state.lock().records.values().cloned().collect();
        records.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key().cmp(&b.key())));
        records
    }

    /// Current score of a server; unknown servers are neutral.
    #[must_use]
    pub fn score_of(&self, server: &ServerDescriptor) -> f64 {
        effective_score(&self.state.lock().records, server)
    }

    /// Whether `server` is known to accept array batches.
    #[must_use]
    pub fn supports_array_batch(&self, server: &ServerDescriptor) -> bool {
        self.state.lock().records.get(&server.key()).is_some_and(|r| r.supports_array_batch)
    }

    /// Raise the best observed height. Returns the new best.
    pub fn update_best_height(&self, height: u32) -> u32 {
        self.best_height.fetch_max(height, Ordering::SeqCst).max(height)
    }

    /// Best chain height any connection has reported.
    #[must_use]
    pub fn best_height(&self) -> u32 {
        self.best_height.load(Ordering::SeqCst)
    }

    /// Whether a server at `height` trails the best height by more than the
    /// allowed lag.
    #[must_use]
    pub fn is_stale(&self, height: u32) -> bool {
        self.best_height().saturating_sub(height) > self.config.stale_lag
    }

    /// The `k` best-scored selectable servers, best first.
    #[must_use]
    pub fn top_servers(&self, k: usize, exclude: &HashSet<String>) -> Vec<ServerDescriptor> {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        let mut ranked: Vec<(&ServerDescriptor, f64)> = self
            .available(&state.records, exclude, now)
            .into_iter()
            .map(|s| (s, effective_score(&state.records, s)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.key().cmp(&b.0.key())));
        ranked.into_iter().take(k).map(|(s, _)| s.clone()).collect()
    }

    /// Up to `n` distinct servers drawn with the selection policy.
    #[must_use]
    pub fn candidates(&self, n: usize, exclude: &HashSet<String>) -> Vec<ServerDescriptor> {
        let mut taken = exclude.clone();
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let Some(server) = self.select_server(&taken) else {
                break;
            };
            taken.insert(server.key());
            out.push(server);
        }
        out
    }

    /// Pick one server.
    ///
    /// The first pick of the process returns the best known server if it
    /// scores at least the cold-start threshold. Every n-th pick explores a
    /// server that is unknown or untried for a while. Otherwise the pick is
    /// random, weighted by `max(1, score)`. When nothing is selectable the
    /// oldest blacklist entries are released; the last resort is a random
    /// seed.
    #[must_use]
    pub fn select_server(&self, exclude: &HashSet<String>) -> Option<ServerDescriptor> {
        let now = self.clock.now_ms();
        let mut guard = self.state.lock();
        let CacheState { records, selections, rng } = &mut *guard;
        *selections += 1;
        let pick_number = *selections;

        let available = self.available(records, exclude, now);

        if pick_number == 1 {
            let best = available
                .iter()
                .filter_map(|s| {
                    records.get(&s.key()).filter(|r| r.success_count > 0).map(|r| (*s, r.score))
                })
                .max_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((server, best_score)) = best {
                if best_score >= self.config.cold_start_score {
                    debug!(server = %server.key(), score = best_score, "cold start selection");
                    return Some(server.clone());
                }
            }
        }

        let interval = self.config.exploration_interval;
        if interval > 0 && pick_number % interval == 0 {
            let idle = self.config.exploration_idle;
            let fresh: Vec<&ServerDescriptor> = available
                .iter()
                .copied()
                .filter(|s| records.get(&s.key()).is_none_or(|r| r.untried_for(now, idle)))
                .collect();
            if let Some(server) = fresh.choose(rng) {
                debug!(server = %server.key(), "exploration selection");
                return Some((*server).clone());
            }
        }

        if let Some(server) = weighted_pick(&available, records, rng) {
            return Some(server);
        }

        let released = release_oldest_blacklisted(&self.seeds, records, exclude, now);
        if released > 0 {
            info!(released, "no selectable server, released oldest blacklist entries");
            let available = self.available(records, exclude, now);
            if let Some(server) = weighted_pick(&available, records, rng) {
                return Some(server);
            }
        }

        let remaining: Vec<&ServerDescriptor> =
            self.seeds.iter().filter(|s| !exclude.contains(&s.key())).collect();
        remaining.choose(rng).map(|s| (*s).clone())
    }

    fn available<'a>(
        &'a self,
        records: &HashMap<String, ServerHealthRecord>,
        exclude: &HashSet<String>,
        now: u64,
    ) -> Vec<&'a ServerDescriptor> {
        self.seeds
            .iter()
            .filter(|s| {
                let key = s.key();
                !exclude.contains(&key) && !records.get(&key).is_some_and(|r| r.is_blacklisted(now))
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn insert_record(&self, record: ServerHealthRecord) {
        self.state.lock().records.insert(record.key(), record);
    }
}

fn effective_score(records: &HashMap<String, ServerHealthRecord>, server: &ServerDescriptor) -> f64 {
    records.get(&server.key()).map_or(NEUTRAL_SCORE, |r| r.score)
}

fn weighted_pick(
    candidates: &[&ServerDescriptor],
    records: &HashMap<String, ServerHealthRecord>,
    rng: &mut StdRng,
) -> Option<ServerDescriptor> {
    if candidates.is_empty() {
        return None;
    }
    let weights = candidates.iter().map(|s| effective_score(records, s).max(1.0));
    let index = WeightedIndex::new(weights).ok()?;
    Some(candidates[index.sample(rng)].clone())
}

/// Clear the blacklist of the earliest-expiring half of the blacklisted
/// seeds. Returns how many were released.
fn release_oldest_blacklisted(
    seeds: &[ServerDescriptor],
    records: &mut HashMap<String, ServerHealthRecord>,
    exclude: &HashSet<String>,
    now: u64,
) -> usize {
    let mut blacklisted: Vec<(String, u64)> = seeds
        .iter()
        .map(ServerDescriptor::key)
        .filter(|key| !exclude.contains(key))
        .filter_map(|key| {
            let until = records.get(&key).filter(|r| r.is_blacklisted(now))?.blacklist_until?;
            Some((key, until))
        })
        .collect();
    if blacklisted.is_empty() {
        return 0;
    }
    blacklisted.sort_by_key(|(_, until)| *until);
    let count = blacklisted.len().div_ceil(2);
    for (key, _) in blacklisted.into_iter().take(count) {
        if let Some(record) = records.get_mut(&key) {
            record.blacklist_until = None;
        }
    }
    count
}
