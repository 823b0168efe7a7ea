//! Per-server health records.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use tern_rpc::ServerImpl;
use tern_types::{ErrorClass, ServerDescriptor};

use crate::{blacklist_duration, score};

/// Number of latency samples kept for the median.
pub const LATENCY_HISTORY: usize = 20;

/// Records that never succeeded and were not tried for this long are dropped
/// on load.
pub const PRUNE_AFTER: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Smoothing factor of the rolling average latency.
const LATENCY_ALPHA: f64 = 0.3;

/// What a successful attempt learned about the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuccessInfo {
    /// Round trip of the attempt.
    pub latency: Duration,
    /// Negotiated protocol version.
    pub protocol_version: Option<String>,
    /// Detected implementation.
    pub implementation: Option<ServerImpl>,
    /// Pruning limit advertised by the server.
    pub pruning: Option<u64>,
}

impl SuccessInfo {
    /// Info carrying only a latency.
    #[must_use]
    pub fn latency(latency: Duration) -> Self {
        Self { latency, ..Default::default() }
    }

    /// Attach the detected implementation.
    #[must_use]
    pub fn with_implementation(mut self, implementation: ServerImpl) -> Self {
        self.implementation = Some(implementation);
        self
    }

    /// Attach the pruning limit from `server.features`.
    #[must_use]
    pub const fn with_pruning(mut self, pruning: Option<u64>) -> Self {
        self.pruning = pruning;
        self
    }

    /// Attach the negotiated protocol version.
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }
}

/// Everything known about one server. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthRecord {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Whether the server is reached over TLS.
    #[serde(rename = "useTls")]
    pub tls: bool,
    /// Successful attempts.
    #[serde(default)]
    pub success_count: u64,
    /// Failed attempts.
    #[serde(default)]
    pub failure_count: u64,
    /// Failures since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Rolling average latency in milliseconds.
    #[serde(default)]
    pub avg_latency_ms: f64,
    /// Most recent latency samples, oldest first.
    #[serde(default)]
    pub latency_history: Vec<u64>,
    /// Last attempt of any outcome.
    #[serde(default)]
    pub last_tried: Option<u64>,
    /// Last success.
    #[serde(default)]
    pub last_success: Option<u64>,
    /// Last failure.
    #[serde(default)]
    pub last_failure: Option<u64>,
    /// Negotiated protocol version.
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// Implementation family name.
    #[serde(default)]
    pub implementation: Option<String>,
    /// Whether array batches are safe.
    #[serde(default)]
    pub supports_array_batch: bool,
    /// Whether the implementation earns the scoring bonus.
    #[serde(default)]
    pub high_performance: bool,
    /// Pruning limit hint.
    #[serde(default)]
    pub pruning: Option<u64>,
    /// Derived score, 0-100.
    #[serde(default)]
    pub score: f64,
    /// The server is not selectable before this time.
    #[serde(default)]
    pub blacklist_until: Option<u64>,
    /// Class of the most recent failure, cleared on success.
    #[serde(default)]
    pub last_error: Option<ErrorClass>,
    /// Failures per class.
    #[serde(default)]
    pub error_counts: HashMap<ErrorClass, u32>,
}

impl ServerHealthRecord {
    /// An empty record for a server never contacted.
    #[must_use]
    pub fn new(server: &ServerDescriptor) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            tls: server.tls,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            latency_history: Vec::new(),
            last_tried: None,
            last_success: None,
            last_failure: None,
            protocol_version: None,
            implementation: None,
            supports_array_batch: false,
            high_performance: false,
            pruning: None,
            score: 0.0,
            blacklist_until: None,
            last_error: None,
            error_counts: HashMap::new(),
        }
    }

    /// The server this record describes.
    #[must_use]
    pub fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor::new(self.host.clone(), self.port, self.tls)
    }

    /// The `host:port` identity key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Apply a successful attempt.
    pub fn record_success(&mut self, now_ms: u64, info: &SuccessInfo) {
        let latency_ms = info.latency.as_millis() as u64;
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_tried = Some(now_ms);
        self.last_success = Some(now_ms);
        self.blacklist_until = None;
        self.last_error = None;

        self.avg_latency_ms = if self.success_count == 1 || self.avg_latency_ms == 0.0 {
            latency_ms as f64
        } else {
            LATENCY_ALPHA * latency_ms as f64 + (1.0 - LATENCY_ALPHA) * self.avg_latency_ms
        };
        self.latency_history.push(latency_ms);
        if self.latency_history.len() > LATENCY_HISTORY {
            let excess = self.latency_history.len() - LATENCY_HISTORY;
            self.latency_history.drain(..excess);
        }

        if let Some(version) = &info.protocol_version {
            self.protocol_version = Some(version.clone());
        }
        if let Some(implementation) = &info.implementation {
            self.implementation = Some(implementation.name().to_string());
            self.supports_array_batch = implementation.supports_array_batch();
            self.high_performance = implementation.is_high_performance();
        }
        if info.pruning.is_some() {
            self.pruning = info.pruning;
        }
        self.score = score(self, now_ms);
    }

    /// Apply a failed attempt and extend the blacklist.
    pub fn record_failure(&mut self, now_ms: u64, class: ErrorClass) {
        self.failure_count += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_tried = Some(now_ms);
        self.last_failure = Some(now_ms);
        self.last_error = Some(class);
        *self.error_counts.entry(class).or_default() += 1;

        let ban = blacklist_duration(self.consecutive_failures, class);
        self.blacklist_until = Some(now_ms.saturating_add(ban.as_millis() as u64));
        self.score = score(self, now_ms);
    }

    /// Whether the server is blacklisted at `now_ms`.
    #[must_use]
    pub fn is_blacklisted(&self, now_ms: u64) -> bool {
        self.blacklist_until.is_some_and(|until| now_ms < until)
    }

    /// Median of the latency history, if any.
    #[must_use]
    pub fn median_latency_ms(&self) -> Option<f64> {
        if self.latency_history.is_empty() {
            return None;
        }
        let mut sorted = self.latency_history.clone();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
        } else {
            sorted[mid] as f64
        })
    }

    /// Whether the record should be dropped on load.
    #[must_use]
    pub fn should_prune(&self, now_ms: u64) -> bool {
        if self.success_count > 0 {
            return false;
        }
        let horizon = PRUNE_AFTER.as_millis() as u64;
        self.last_tried.is_none_or(|tried| now_ms.saturating_sub(tried) > horizon)
    }

    /// Whether the server was not tried within `window` of `now_ms`.
    #[must_use]
    pub fn untried_for(&self, now_ms: u64, window: Duration) -> bool {
        self.last_tried.is_none_or(|tried| now_ms.saturating_sub(tried) >= window.as_millis() as u64)
    }
}
