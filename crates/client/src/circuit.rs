//! Consecutive-failure circuit breaker.

use std::time::Duration;

use derive_more::Display;
use parking_lot::Mutex;
use tern_types::{TernError, TernResult};
use tokio::time::Instant;

/// Breaker position.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    #[display("closed")]
    Closed,
    /// Calls are rejected until the cooldown elapses.
    #[display("open")]
    Open,
    /// One trial call is allowed through.
    #[display("half-open")]
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Opens after `threshold` consecutive failures and half-opens once
/// `cooldown` has elapsed. A successful trial call closes it again, a failed one
/// re-opens it for another cooldown. A trial call that is never settled stops
/// blocking other callers after one cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub const fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    /// Current position, promoting `Open` to `HalfOpen` when the cooldown is over.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Consecutive failures recorded since the last success.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Whether [`check`](Self::check) would admit a call now. Does not
    /// claim the half-open trial call.
    #[must_use]
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.trial_started.is_none_or(|at| at.elapsed() >= self.cooldown),
            CircuitState::Open => false,
        }
    }

    /// Admit a call or reject it with [`TernError::CircuitOpen`].
    ///
    /// In the half-open state only one trial call is admitted at a time.
    pub fn check(&self) -> TernResult<()> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => match inner.trial_started.map(|at| at.elapsed()) {
                Some(probing) if probing < self.cooldown => {
                    Err(TernError::CircuitOpen { retry_after: self.cooldown.saturating_sub(probing) })
                }
                _ => {
                    inner.trial_started = Some(Instant::now());
                    Ok(())
                }
            },
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |at| at.elapsed());
                Err(TernError::CircuitOpen { retry_after: self.cooldown.saturating_sub(elapsed) })
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            debug!(failures = inner.failures, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.failures = inner.failures.saturating_add(1);
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(failures = inner.failures, cooldown_ms = self.cooldown.as_millis() as u64, "circuit opened");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_started = None;
        }
    }

    /// Settle a call admitted by [`check`](Self::check).
    ///
    /// Error responses from a server mean it was reached and count as a
    /// success. Other errors count as a failure when `counts` says so;
    /// otherwise they leave the breaker where it is and free the half-open
    /// trial call for the next caller.
    pub fn observe(&self, error: Option<&TernError>, counts: impl Fn(&TernError) -> bool) {
        match error {
            None | Some(TernError::Server { .. }) => self.record_success(),
            Some(e) if counts(e) => self.record_failure(),
            Some(_) => self.release(),
        }
    }

    /// Free the half-open trial call without judging the outcome.
    pub fn release(&self) {
        self.inner.lock().trial_started = None;
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner.opened_at.is_some_and(|at| at.elapsed() >= self.cooldown)
        {
            inner.state = CircuitState::HalfOpen;
            inner.trial_started = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(threshold, cooldown);
        for _ in 0..threshold {
            breaker.record_failure();
        }
        breaker
    }

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        match breaker.check() {
            Err(TernError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_call() {
        let breaker = tripped(3, Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.check().is_ok());
        assert!(breaker.check().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = tripped(3, Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncounted_outcome_readmits_half_open_call() {
        let breaker = tripped(1, Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.check().is_ok());

        breaker.observe(Some(&TernError::NotConnected), |_| false);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_response_closes_half_open() {
        let breaker = tripped(1, Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.check().is_ok());

        let rejected = TernError::Server { code: 1, message: "rejected".to_string() };
        breaker.observe(Some(&rejected), |_| true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counted_outcome_reopens() {
        let breaker = tripped(1, Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.check().is_ok());

        breaker.observe(Some(&TernError::NotConnected), |_| true);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_half_open_call_expires_after_cooldown() {
        let breaker = tripped(1, Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.check().is_ok());
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.check().is_ok());
    }
}
