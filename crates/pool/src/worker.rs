//! A pooled client with its own breaker.

use std::time::Duration;

use derive_more::Debug;
use serde_json::Value;
use tern_client::{CircuitBreaker, CircuitState, ProtocolClient};
use tern_types::{ServerDescriptor, TernError, TernResult};

/// One pool member.
///
/// The breaker counts connection-class failures only; error responses from
/// the server say nothing about the worker's health.
#[derive(Debug)]
pub struct PoolWorker {
    id: usize,
    #[debug(skip)]
    client: ProtocolClient,
    breaker: CircuitBreaker,
}

impl PoolWorker {
    pub(crate) const fn new(id: usize, client: ProtocolClient, breaker: CircuitBreaker) -> Self {
        Self { id, client, breaker }
    }

    /// Pool-unique worker id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// The underlying client.
    #[must_use]
    pub const fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// Server the worker is connected to.
    #[must_use]
    pub fn server(&self) -> Option<ServerDescriptor> {
        self.client.current_server()
    }

    /// Requests in flight or queued on this worker.
    #[must_use]
    pub fn load(&self) -> usize {
        self.client.load()
    }

    /// Worker breaker position.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Whether calls should be routed here.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.client.is_connected() && self.breaker.state() != CircuitState::Open
    }

    /// Send one request through the worker breaker.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> TernResult<Value> {
        self.breaker.check()?;
        let result = self.client.request(method, params).await;
        self.observe(result.as_ref().err());
        result
    }

    /// Send a batch through the worker breaker.
    pub async fn batch(&self, calls: Vec<(String, Vec<Value>)>) -> TernResult<Vec<TernResult<Value>>> {
        self.breaker.check()?;
        let result = self.client.batch(calls).await;
        self.observe(result.as_ref().err());
        result
    }

    /// Ping with a hard deadline so a stuck worker cannot hold up the caller.
    pub async fn ping(&self, timeout: Duration) -> TernResult<Duration> {
        match tokio::time::timeout(timeout, self.client.ping()).await {
            Ok(result) => {
                self.observe(result.as_ref().err());
                result
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(TernError::RequestTimeout { method: "server.ping".to_string(), timeout })
            }
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.client.disconnect().await;
    }

    fn observe(&self, error: Option<&TernError>) {
        self.breaker.observe(error, TernError::should_retry);
    }
}
