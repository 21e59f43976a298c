use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// How many times a request is re-sent after a transient failure, and how
/// long to wait between sends.
///
/// Retries only happen before any response body is consumed, so a stream
/// that already delivered text is never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-sends allowed after the first attempt.
    pub max_retries: u32,
    /// Wait before the first re-send; doubles for each one after.
    pub initial_backoff: Duration,
    /// Upper bound on any single wait.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that sends each request exactly once.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (zero-based) may be followed by another.
    pub fn has_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Wait after failed attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Whether a non-success response looks transient: throttling, a gateway
/// error, or an upstream that said as much in its error text.
pub fn is_transient_failure(status: u16, body: &str) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504) || transient_text().is_match(body)
}

fn transient_text() -> &'static Regex {
    static TRANSIENT: OnceLock<Regex> = OnceLock::new();
    TRANSIENT.get_or_init(|| {
        Regex::new(
            r"(?i)rate.?limit|overloaded|temporarily.?unavailable|service.?unavailable|bad.?gateway|connection.?(refused|reset)",
        )
        .expect("transient failure regex compiles")
    })
}
