//! Server scoring and blacklist schedule.

use std::time::Duration;

use tern_types::ErrorClass;

use crate::ServerHealthRecord;

/// Score used to rank a server with no history.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Base blacklist, in minutes, by consecutive failure count (1st..5th+).
const BLACKLIST_MINUTES: [u64; 5] = [1, 5, 15, 30, 60];

const SUCCESS_WEIGHT: f64 = 40.0;
const LATENCY_WEIGHT: f64 = 30.0;
const RECENCY_WEIGHT: f64 = 20.0;

/// Latency at or below this earns the full latency component.
const FAST_MS: f64 = 100.0;
/// Latency at or above this earns nothing.
const SLOW_MS: f64 = 3_000.0;
const RECENCY_HOURS: f64 = 24.0;

const FAILURE_PENALTY: f64 = 10.0;
const MAX_FAILURE_PENALTY: f64 = 30.0;
const HARD_ERROR_PENALTY: f64 = 15.0;
const IMPLEMENTATION_BONUS: f64 = 5.0;

/// How long a server is unselectable after its `consecutive`-th failure of
/// `class`.
#[must_use]
pub fn blacklist_duration(consecutive: u32, class: ErrorClass) -> Duration {
    let step = (consecutive.max(1) as usize).min(BLACKLIST_MINUTES.len()) - 1;
    let minutes = BLACKLIST_MINUTES[step] * u64::from(class.blacklist_multiplier());
    Duration::from_secs(minutes * 60)
}

/// Compute the 0-100 score of a record at `now_ms`.
#[must_use]
pub fn score(record: &ServerHealthRecord, now_ms: u64) -> f64 {
    let attempts = record.success_count + record.failure_count;
    if attempts == 0 {
        return NEUTRAL_SCORE;
    }

    let success = SUCCESS_WEIGHT * record.success_count as f64 / attempts as f64;

    let latency = record
        .median_latency_ms()
        .or((record.avg_latency_ms > 0.0).then_some(record.avg_latency_ms))
        .map_or(0.0, |ms| {
            let fraction = ((SLOW_MS - ms) / (SLOW_MS - FAST_MS)).clamp(0.0, 1.0);
            LATENCY_WEIGHT * fraction
        });

    let recency = record.last_success.map_or(0.0, |at| {
        let hours = now_ms.saturating_sub(at) as f64 / 3_600_000.0;
        RECENCY_WEIGHT * (1.0 - hours / RECENCY_HOURS).max(0.0)
    });

    let failures =
        (FAILURE_PENALTY * f64::from(record.consecutive_failures)).min(MAX_FAILURE_PENALTY);
    let hard = if record.last_error.is_some_and(ErrorClass::is_hard) {
        HARD_ERROR_PENALTY
    } else {
        0.0
    };
    let bonus = if record.high_performance { IMPLEMENTATION_BONUS } else { 0.0 };

    (success + latency + recency - failures - hard + bonus).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tern_rpc::ServerImpl;
    use tern_types::ServerDescriptor;

    use super::*;
    use crate::SuccessInfo;

    const NOW: u64 = 1_700_000_000_000;
    const HOUR: u64 = 3_600_000;

    fn record() -> ServerHealthRecord {
        ServerHealthRecord::new(&ServerDescriptor::tls("a.example", 50002))
    }

    #[rstest]
    #[case::first_timeout(1, ErrorClass::Timeout, 60)]
    #[case::second_timeout(2, ErrorClass::Timeout, 5 * 60)]
    #[case::fifth_timeout(5, ErrorClass::Timeout, 60 * 60)]
    #[case::tenth_timeout(10, ErrorClass::Timeout, 60 * 60)]
    #[case::first_dns(1, ErrorClass::DnsError, 24 * 60)]
    #[case::first_tls(1, ErrorClass::TlsError, 6 * 60)]
    #[case::third_server(3, ErrorClass::ServerError, 30 * 60)]
    #[case::protocol(5, ErrorClass::ProtocolError, 24 * 60 * 60)]
    #[case::zero_treated_as_first(0, ErrorClass::ConnectionReset, 60)]
    fn test_blacklist_duration(
        #[case] consecutive: u32,
        #[case] class: ErrorClass,
        #[case] secs: u64,
    ) {
        assert_eq!(blacklist_duration(consecutive, class), Duration::from_secs(secs));
    }

    #[test]
    fn test_unknown_is_neutral() {
        assert_eq!(score(&record(), NOW), NEUTRAL_SCORE);
    }

    #[test]
    fn test_fast_recent_server_scores_high() {
        let mut r = record();
        for _ in 0..5 {
            r.record_success(NOW, &SuccessInfo::latency(Duration::from_millis(80)));
        }
        assert_eq!(score(&r, NOW), 90.0);

        r.high_performance = true;
        assert_eq!(score(&r, NOW), 95.0);
    }

    #[test]
    fn test_recency_decays() {
        let mut r = record();
        r.record_success(NOW, &SuccessInfo::latency(Duration::from_millis(80)));
        let fresh = score(&r, NOW);
        let half_day = score(&r, NOW + 12 * HOUR);
        let stale = score(&r, NOW + 48 * HOUR);
        assert!(fresh > half_day && half_day > stale);
        assert_eq!(fresh - stale, 20.0);
    }

    #[test]
    fn test_failure_penalty_capped() {
        let mut r = record();
        r.record_success(NOW, &SuccessInfo::latency(Duration::from_millis(80)));
        for _ in 0..6 {
            r.record_failure(NOW, ErrorClass::Timeout);
        }
        // 1/7 success, full latency, full recency, -30.
        let expected = 40.0 / 7.0 + 30.0 + 20.0 - 30.0;
        assert!((score(&r, NOW) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_hard_error_penalty() {
        let mut soft = record();
        soft.record_success(NOW, &SuccessInfo::latency(Duration::from_millis(80)));
        let mut hard = soft.clone();
        soft.record_failure(NOW, ErrorClass::Timeout);
        hard.record_failure(NOW, ErrorClass::TlsError);
        assert!((score(&soft, NOW) - score(&hard, NOW) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_clamped() {
        let mut r = record();
        for _ in 0..3 {
            r.record_failure(NOW, ErrorClass::DnsError);
        }
        assert_eq!(score(&r, NOW), 0.0);

        r.record_success(NOW, &SuccessInfo::latency(Duration::from_millis(1)).with_implementation(
            ServerImpl::ElectrumX { version: "1.16.0".into() },
        ));
        assert!(score(&r, NOW) <= 100.0);
    }
}
