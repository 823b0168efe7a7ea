//! Request coalescing.

use std::{collections::HashMap, future::Future, time::Duration};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use serde_json::Value;
use tern_types::TernResult;
use tokio::time::Instant;

/// How long a completed answer keeps satisfying identical requests.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_secs(2);

type SharedCall<T> = Shared<BoxFuture<'static, TernResult<T>>>;

/// Collapses identical concurrent requests into one.
///
/// Callers that arrive while a request with the same key is running await
/// the same future. Successful results are kept for a short window so a
/// burst of identical lookups right after completion does not go back to
/// the network. Errors are never kept.
///
/// Answers are single JSON values by default; batched lookups coalesce on
/// their whole result list.
pub struct RequestCoalescer<T = Value> {
    in_flight: Mutex<HashMap<String, SharedCall<T>>>,
    recent: Mutex<HashMap<String, (Instant, T)>>,
    window: Duration,
}

impl<T: Clone + Send + Sync + 'static> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_WINDOW)
    }
}

impl<T> std::fmt::Debug for RequestCoalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("in_flight", &self.in_flight.lock().len())
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    /// Create a coalescer that reuses answers for `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { in_flight: Mutex::new(HashMap::new()), recent: Mutex::new(HashMap::new()), window }
    }

    /// Number of distinct requests currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Run `call` under `key`, or join an identical request already running.
    pub async fn run<F, Fut>(&self, key: &str, call: F) -> TernResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TernResult<T>> + Send + 'static,
    {
        if let Some(value) = self.recent_value(key) {
            crate::metrics::record_coalesced("recent");
            return Ok(value);
        }

        let shared = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(existing) => {
                    crate::metrics::record_coalesced("in_flight");
                    existing.clone()
                }
                None => {
                    let shared = call().boxed().shared();
                    in_flight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        let result = shared.clone().await;

        if let Ok(value) = &result {
            let now = Instant::now();
            let mut recent = self.recent.lock();
            recent.retain(|_, (at, _)| now.duration_since(*at) < self.window);
            recent.insert(key.to_string(), (now, value.clone()));
        }
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(key).is_some_and(|current| current.ptr_eq(&shared)) {
            in_flight.remove(key);
        }
        result
    }

    /// Forget reusable answers whose key contains `fragment`.
    pub fn forget_matching(&self, fragment: &str) {
        self.recent.lock().retain(|key, _| !key.contains(fragment));
    }

    fn recent_value(&self, key: &str) -> Option<T> {
        let recent = self.recent.lock();
        let (at, value) = recent.get(key)?;
        (at.elapsed() < self.window).then(|| value.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;
    use tern_types::TernError;

    use super::*;

    fn counted(
        calls: &Arc<AtomicUsize>,
        result: TernResult<Value>,
    ) -> impl Future<Output = TernResult<Value>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            result
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_request() {
        let coalescer = RequestCoalescer::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            coalescer.run("k", || counted(&calls, Ok(json!(1)))),
            coalescer.run("k", || counted(&calls, Ok(json!(2)))),
            coalescer.run("k", || counted(&calls, Ok(json!(3)))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, Ok(json!(1)));
        assert_eq!(b, Ok(json!(1)));
        assert_eq!(c, Ok(json!(1)));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_coalesce() {
        let coalescer = RequestCoalescer::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            coalescer.run("a", || counted(&calls, Ok(json!("a")))),
            coalescer.run("b", || counted(&calls, Ok(json!("b")))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a, Ok(json!("a")));
        assert_eq!(b, Ok(json!("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_answer_reused_within_window() {
        let coalescer = RequestCoalescer::default();
        let calls = Arc::new(AtomicUsize::new(0));

        coalescer.run("k", || counted(&calls, Ok(json!(1)))).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let reused = coalescer.run("k", || counted(&calls, Ok(json!(2)))).await;
        assert_eq!(reused, Ok(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let fresh = coalescer.run("k", || counted(&calls, Ok(json!(2)))).await;
        assert_eq!(fresh, Ok(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_reused() {
        let coalescer = RequestCoalescer::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let failed = coalescer.run("k", || counted(&calls, Err(TernError::NotConnected))).await;
        assert_eq!(failed, Err(TernError::NotConnected));

        let retried = coalescer.run("k", || counted(&calls, Ok(json!(7)))).await;
        assert_eq!(retried, Ok(json!(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_matching() {
        let coalescer = RequestCoalescer::default();
        let calls = Arc::new(AtomicUsize::new(0));

        coalescer.run("listunspent:[\"h1\"]", || counted(&calls, Ok(json!([])))).await.unwrap();
        coalescer.forget_matching("h1");
        coalescer.run("listunspent:[\"h1\"]", || counted(&calls, Ok(json!([])))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_answers_coalesce() {
        let coalescer: RequestCoalescer<Vec<TernResult<Value>>> = RequestCoalescer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let batch = |n: i64| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec![Ok(json!(n)), Err(TernError::NotConnected)])
            }
        };

        let (a, b) = tokio::join!(coalescer.run("batch", || batch(1)), coalescer.run("batch", || batch(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(a, Ok(vec![Ok(json!(1)), Err(TernError::NotConnected)]));
    }
}
