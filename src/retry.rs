//! Retry classification and backoff for OTLP/HTTP exports.
//!
//! Status handling follows the OTLP/HTTP failure rules: 2xx succeeds, 429 and
//! 5xx are transient, every other 4xx is permanent. Transient responses may
//! carry a `Retry-After` header, either as delay-seconds or as an HTTP date.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use http::StatusCode;
use rand::Rng;

/// How a single HTTP attempt should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 2xx, hand the response back.
    Success,
    /// Not worth repeating; the batch is dropped.
    Permanent,
    /// Repeat after the policy backoff.
    Retryable,
    /// Repeat after the server supplied delay.
    Throttled(Duration),
}

impl Verdict {
    pub fn is_transient(&self) -> bool {
        matches!(self, Verdict::Retryable | Verdict::Throttled(_))
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound applied to `Retry-After` hints.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that gives up after the first attempt.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.capped_backoff(attempt);
        // up to 10% jitter
        let jitter_range = base.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(0..jitter_range)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    fn capped_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Wait before the next attempt, preferring a server hint when present.
    pub fn delay_for(&self, attempt: u32, verdict: Verdict) -> Duration {
        match verdict {
            Verdict::Throttled(hint) => hint.min(self.max_retry_after),
            _ => self.backoff(attempt),
        }
    }
}

/// Classifies a response status, reading `Retry-After` for transient codes.
pub fn classify_status(status: StatusCode, retry_after: Option<&str>) -> Verdict {
    if status.is_success() {
        return Verdict::Success;
    }
    match status.as_u16() {
        429 | 500..=599 => retry_after
            .and_then(parse_retry_after)
            .map(Verdict::Throttled)
            .unwrap_or(Verdict::Retryable),
        400..=499 => Verdict::Permanent,
        // 1xx/3xx are not expected from a collector
        _ => Verdict::Retryable,
    }
}

/// Parses a `Retry-After` value: `"120"` or `"Fri, 31 Dec 1999 23:59:59 GMT"`.
///
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let now = DateTime::<Utc>::from(SystemTime::now());
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes() {
        assert_eq!(classify_status(StatusCode::OK, None), Verdict::Success);
        assert_eq!(classify_status(StatusCode::ACCEPTED, None), Verdict::Success);
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400u16, 401, 403, 404, 413, 499] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status, None), Verdict::Permanent, "{code}");
        }
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None),
            Verdict::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, None),
            Verdict::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some("30")),
            Verdict::Throttled(Duration::from_secs(30))
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, Some("garbage")),
            Verdict::Retryable
        );
    }

    #[test]
    fn retry_after_http_date_in_the_past_is_immediate() {
        assert_eq!(
            parse_retry_after("Fri, 31 Dec 1999 23:59:59 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn retry_after_http_date_in_the_future() {
        let at = Utc::now() + chrono::Duration::seconds(120);
        let header = at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let delay = parse_retry_after(&header).unwrap();
        assert!(delay > Duration::from_secs(100) && delay <= Duration::from_secs(120));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            max_retry_after: Duration::from_secs(30),
        };
        assert_eq!(policy.capped_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.capped_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.capped_backoff(3), Duration::from_millis(400));
        assert_eq!(policy.capped_backoff(10), Duration::from_millis(1000));

        let jittered = policy.backoff(2);
        assert!(jittered >= Duration::from_millis(200));
        assert!(jittered < Duration::from_millis(220));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(1, Verdict::Throttled(Duration::from_secs(900)));
        assert_eq!(delay, policy.max_retry_after);
    }
}
