//! The worker pool.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use derive_more::{Debug, Display};
use futures::{
    FutureExt, StreamExt,
    future::{self, BoxFuture},
    stream::FuturesUnordered,
};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tern_client::{CircuitBreaker, ProtocolClient};
use tern_runtime::TaskSlot;
use tern_servers::ServerCache;
use tern_types::{ServerDescriptor, TernError, TernResult};
use tokio::time::Instant;

use crate::{PoolConfig, PoolWorker, metrics};

type Call = (String, Vec<Value>);

/// How much of the pool is up.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// At least the configured minimum of workers is connected.
    #[display("healthy")]
    Healthy,
    /// Fewer workers than the minimum, but at least one.
    #[display("degraded")]
    Degraded,
    /// No workers. Calls go through an ephemeral client.
    #[display("fallback")]
    Fallback,
}

impl PoolMode {
    const fn for_workers(count: usize, min_workers: usize) -> Self {
        if count == 0 {
            Self::Fallback
        } else if count >= min_workers {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    #[debug(skip)]
    cache: Arc<ServerCache>,
    workers: Mutex<Vec<Arc<PoolWorker>>>,
    #[debug(skip)]
    fallback: Mutex<Option<ProtocolClient>>,
    next_id: AtomicUsize,
    closed: AtomicBool,
    health: TaskSlot,
    refill: TaskSlot,
}

/// A set of independently connected clients.
///
/// `Clone` is cheap (shared `Arc` state). Background tasks hold only weak
/// references, so dropping the last handle stops them.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Connect up to `max_workers` workers in parallel and start health
    /// checks.
    ///
    /// Never fails: with no reachable server the pool starts in
    /// [`PoolMode::Fallback`] and keeps trying in the background.
    pub async fn start(cache: Arc<ServerCache>, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            cache,
            workers: Mutex::new(Vec::new()),
            fallback: Mutex::new(None),
            next_id: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            health: TaskSlot::new(),
            refill: TaskSlot::new(),
        });

        let requested = inner.config.max_workers;
        let connected = inner.connect_workers(requested).await;
        let mode = inner.mode();
        match mode {
            PoolMode::Healthy => info!(requested, connected, "pool started"),
            PoolMode::Degraded => warn!(requested, connected, "pool started degraded"),
            PoolMode::Fallback => {
                warn!(requested, "no pool worker connected, starting in fallback mode");
                inner.schedule_refill(inner.config.recovery_delay);
            }
        }
        inner.start_health_checks();
        Self { inner }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> PoolMode {
        self.inner.mode()
    }

    /// Number of connected workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Snapshot of the workers.
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<PoolWorker>> {
        self.inner.workers.lock().clone()
    }

    /// Servers the workers are connected to.
    #[must_use]
    pub fn servers(&self) -> Vec<ServerDescriptor> {
        self.inner.workers.lock().iter().filter_map(|w| w.server()).collect()
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The shared server cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ServerCache> {
        &self.inner.cache
    }

    /// Send one request to the least busy worker.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> TernResult<Value> {
        match self.inner.least_busy() {
            Some(worker) => worker.request(method, params).await,
            None => self.inner.fallback_client().request(method, params).await,
        }
    }

    /// Send a batch to the least busy worker.
    pub async fn batch_request(&self, calls: Vec<Call>) -> TernResult<Vec<TernResult<Value>>> {
        match self.inner.least_busy() {
            Some(worker) => worker.batch(calls).await,
            None => self.inner.fallback_client().batch(calls).await,
        }
    }

    /// Run independent groups of requests concurrently, one group per
    /// worker in turn.
    ///
    /// The outer result is in group order whatever order the groups finish
    /// in. A group whose worker fails at the transport level is retried
    /// once on the next worker; the first group that still fails fails the
    /// call.
    pub async fn parallel_batch(&self, groups: Vec<Vec<Call>>) -> TernResult<Vec<Vec<TernResult<Value>>>> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.inner.available();
        let fallback = workers.is_empty().then(|| self.inner.fallback_client());
        let count = groups.len();

        let mut pending: FuturesUnordered<_> = groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| {
                let route = match &fallback {
                    Some(client) => Route::Client(client.clone()),
                    None => Route::Worker {
                        primary: Arc::clone(&workers[index % workers.len()]),
                        backup: (workers.len() > 1)
                            .then(|| Arc::clone(&workers[(index + 1) % workers.len()])),
                    },
                };
                async move { (index, route.batch(group).await) }
            })
            .collect();

        let mut results: Vec<Option<Vec<TernResult<Value>>>> = (0..count).map(|_| None).collect();
        while let Some((index, result)) = pending.next().await {
            results[index] = Some(result?);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Send the same request to every worker; the first success wins and the
    /// rest are cancelled.
    pub async fn race_request(&self, method: &str, params: Vec<Value>) -> TernResult<Value> {
        let workers = self.inner.available();
        if workers.is_empty() {
            return self.inner.fallback_client().request(method, params).await;
        }
        let races: Vec<BoxFuture<'_, TernResult<Value>>> = workers
            .iter()
            .map(|worker| {
                let params = params.clone();
                async move { worker.request(method, params).await }.boxed()
            })
            .collect();
        let (value, _) = future::select_ok(races).await?;
        Ok(value)
    }

    /// Split `calls` into chunks and run them with
    /// [`parallel_batch`](Self::parallel_batch). Results are flattened back
    /// into request order.
    pub async fn distributed_batch(&self, calls: Vec<Call>) -> TernResult<Vec<TernResult<Value>>> {
        let chunk_size = self.inner.config.chunk_size.max(1);
        let groups: Vec<Vec<Call>> = calls.chunks(chunk_size).map(<[Call]>::to_vec).collect();
        debug!(calls = calls.len(), groups = groups.len(), "distributing batch");
        Ok(self.parallel_batch(groups).await?.into_iter().flatten().collect())
    }

    /// Ping every worker concurrently and drop the ones that do not answer.
    /// Replacements are scheduled after a jittered delay. Returns how many
    /// workers were dropped.
    pub async fn health_check(&self) -> usize {
        self.inner.health_check().await
    }

    /// Stop background tasks and disconnect every worker.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.health.cancel();
        inner.refill.cancel();

        let workers = std::mem::take(&mut *inner.workers.lock());
        future::join_all(workers.iter().map(|w| w.shutdown())).await;
        let fallback = inner.fallback.lock().take();
        if let Some(client) = fallback {
            client.disconnect().await;
        }
        metrics::record_workers(0);
        info!(workers = workers.len(), "pool shut down");
    }
}

enum Route {
    Worker { primary: Arc<PoolWorker>, backup: Option<Arc<PoolWorker>> },
    Client(ProtocolClient),
}

impl Route {
    async fn batch(self, group: Vec<Call>) -> TernResult<Vec<TernResult<Value>>> {
        match self {
            Self::Client(client) => client.batch(group).await,
            Self::Worker { primary, backup } => match primary.batch(group.clone()).await {
                Err(e) if e.should_retry() || matches!(e, TernError::CircuitOpen { .. }) => {
                    let Some(backup) = backup else { return Err(e) };
                    debug!(from = primary.id(), to = backup.id(), error = %e, "group moved to another worker");
                    backup.batch(group).await
                }
                other => other,
            },
        }
    }
}

impl PoolInner {
    fn mode(&self) -> PoolMode {
        PoolMode::for_workers(self.workers.lock().len(), self.config.min_workers)
    }

    fn available(&self) -> Vec<Arc<PoolWorker>> {
        self.workers.lock().iter().filter(|w| w.is_available()).cloned().collect()
    }

    fn least_busy(&self) -> Option<Arc<PoolWorker>> {
        self.workers.lock().iter().filter(|w| w.is_available()).min_by_key(|w| w.load()).cloned()
    }

    fn fallback_client(&self) -> ProtocolClient {
        self.fallback
            .lock()
            .get_or_insert_with(|| {
                metrics::record_fallback();
                warn!("no pool worker available, using a fallback client");
                ProtocolClient::new(Arc::clone(&self.cache), self.config.client.clone())
            })
            .clone()
    }

    fn servers_in_use(&self) -> HashSet<String> {
        self.workers.lock().iter().filter_map(|w| w.server()).map(|s| s.key()).collect()
    }

    /// Connect `count` more workers in parallel, each steered to its own
    /// server. Returns how many connected.
    async fn connect_workers(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let in_use = self.servers_in_use();
        // Every attempt excludes the servers reserved for its siblings.
        let reserved = self.cache.candidates(count, &in_use);
        let attempts = (0..count).map(|slot| {
            let mut exclude = in_use.clone();
            exclude.extend(
                reserved.iter().enumerate().filter(|(i, _)| *i != slot).map(|(_, s)| s.key()),
            );
            self.connect_worker(exclude)
        });
        let results = future::join_all(attempts).await;

        let connected: Vec<Arc<PoolWorker>> = results
            .into_iter()
            .filter_map(|result| match result {
                Ok(worker) => Some(worker),
                Err(e) => {
                    debug!(error = %e, "pool worker failed to connect");
                    None
                }
            })
            .collect();

        if self.closed.load(Ordering::SeqCst) {
            future::join_all(connected.iter().map(|w| w.shutdown())).await;
            return 0;
        }
        let added = connected.len();
        let mut workers = self.workers.lock();
        workers.extend(connected);
        metrics::record_workers(workers.len());
        added
    }

    async fn connect_worker(&self, exclude: HashSet<String>) -> TernResult<Arc<PoolWorker>> {
        let client = ProtocolClient::new(Arc::clone(&self.cache), self.config.client.clone());
        let server = client.connect_excluding(exclude).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(worker = id, server = %server.key(), "pool worker connected");
        let breaker =
            CircuitBreaker::new(self.config.worker_failure_threshold, self.config.worker_cooldown);
        Ok(Arc::new(PoolWorker::new(id, client, breaker)))
    }

    async fn health_check(self: &Arc<Self>) -> usize {
        let workers = self.workers.lock().clone();
        let timeout = self.config.health_ping_timeout;
        let pings = workers.iter().map(|worker| async move { (worker.id(), worker.ping(timeout).await) });
        let dead: HashSet<usize> = future::join_all(pings)
            .await
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(rtt) => {
                    trace!(worker = id, rtt_ms = rtt.as_millis() as u64, "worker healthy");
                    None
                }
                Err(e) => {
                    warn!(worker = id, error = %e, "worker failed health check");
                    Some(id)
                }
            })
            .collect();

        let removed: Vec<Arc<PoolWorker>> = {
            let mut guard = self.workers.lock();
            let (gone, keep): (Vec<_>, Vec<_>) = guard.drain(..).partition(|w| dead.contains(&w.id()));
            *guard = keep;
            metrics::record_workers(guard.len());
            gone
        };
        for worker in &removed {
            worker.shutdown().await;
        }

        let missing = self.config.max_workers.saturating_sub(self.workers.lock().len());
        if missing > 0 {
            self.schedule_refill(self.config.replace_delay);
        }
        removed.len()
    }

    fn schedule_refill(self: &Arc<Self>, base: Duration) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let delay = jittered(base, self.config.jitter);
        debug!(delay_ms = delay.as_millis() as u64, "pool refill scheduled");
        let weak = Arc::downgrade(self);
        self.refill.schedule(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.refill().await;
            }
        });
    }

    async fn refill(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let missing = self.config.max_workers.saturating_sub(self.workers.lock().len());
        let added = self.connect_workers(missing).await;
        let count = self.workers.lock().len();
        if added > 0 {
            for _ in 0..added {
                metrics::record_replacement();
            }
            info!(added, workers = count, mode = %self.mode(), "pool workers replaced");
            // In-flight calls keep their own handle on the fallback client.
            self.fallback.lock().take();
        }
        if count == 0 {
            self.schedule_refill(self.config.recovery_delay);
        }
    }

    fn start_health_checks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        self.health.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.health_check().await;
            }
        });
    }
}

fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    base + rand::thread_rng().gen_range(Duration::ZERO..=jitter)
}
