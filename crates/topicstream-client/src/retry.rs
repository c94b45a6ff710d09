//! Reconnect Backoff and Status Classification
//!
//! Both engines reconnect on every transport fault and on every retryable
//! server status. This module decides which statuses are retryable and how
//! long to wait between attempts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  engine loop     │ transport fault / retryable status
//! └──────┬───────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  Backoff (per engine)        │
//! │  - attempt counter           │
//! │  - RetryPolicy               │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait 50ms  (backoff)
//!        ├─→ Attempt 3: Wait 100ms (backoff * 2)
//!        ├─→ Attempt 4: Wait 200ms (backoff * 4)
//!        └─→ ...capped at max_backoff, reset after a successful init
//! ```
//!
//! ## Retryable vs Fatal Statuses
//!
//! **Retryable** (reconnect and carry on):
//! - `ABORTED`, `UNAVAILABLE`, `OVERLOADED`, `SESSION_BUSY`
//! - `BAD_SESSION`, `SESSION_EXPIRED`, `TIMEOUT`, `UNDETERMINED`
//! - `INTERNAL_ERROR`: temporary internal error
//!
//! **Fatal** (terminal for the engine):
//! - `SCHEME_ERROR`: topic or consumer does not exist
//! - `BAD_REQUEST`, `UNAUTHORIZED`, `PRECONDITION_FAILED`, `UNSUPPORTED`
//! - All other non-success codes
//!
//! Transport faults (the stream breaking, a connect failure) are always
//! retryable.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use topicstream_proto::StatusCode;

/// Retry policy configuration for exponential reconnect backoff.
///
/// # Backoff Calculation
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// jittered = backoff * (1 - jitter + random(0, 2 * jitter))
/// ```
///
/// # Examples
///
/// ```ignore
/// // Fast reconnects for a local deployment
/// let policy = RetryPolicy {
///     initial_backoff: Duration::from_millis(10),
///     max_backoff: Duration::from_secs(1),
///     backoff_multiplier: 2.0,
///     jitter: 0.0,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Backoff before the second attempt
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,

    /// Relative jitter in `[0, 1)` applied to every backoff
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// RetryPolicy with:
    /// - initial_backoff: 50ms
    /// - max_backoff: 5s
    /// - backoff_multiplier: 2.0
    /// - jitter: 0.25
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        jitter: f64,
    ) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter,
        }
    }

    /// Calculate backoff duration for a given retry attempt (0-indexed),
    /// without jitter.
    ///
    /// ```ignore
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff(0), Duration::from_millis(50));
    /// assert_eq!(policy.backoff(1), Duration::from_millis(100));
    /// ```
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }

    /// Backoff for `attempt` with random jitter applied.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }
}

/// Attempt counter for one engine's reconnect loop.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt. The first attempt after a reset is
    /// immediate.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = if self.attempt == 0 {
            Duration::ZERO
        } else {
            self.policy.jittered_backoff(self.attempt - 1)
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of attempts made since the last reset.
    pub(crate) fn attempts(&self) -> usize {
        self.attempt
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Check if a server status is transient.
pub fn is_retryable_status(status: StatusCode) -> bool {
    match status {
        // Retryable: transient failures
        StatusCode::Aborted => true,
        StatusCode::Unavailable => true,
        StatusCode::Overloaded => true,
        StatusCode::SessionBusy => true,
        StatusCode::BadSession => true,
        StatusCode::SessionExpired => true,
        StatusCode::Timeout => true,
        StatusCode::Undetermined => true,
        StatusCode::InternalError => true, // Temporary internal error

        // Fatal: permanent failures
        StatusCode::SchemeError => false,        // Topic/consumer missing
        StatusCode::BadRequest => false,         // Bad request
        StatusCode::Unauthorized => false,       // Invalid credentials
        StatusCode::PreconditionFailed => false, // Validation error
        StatusCode::Unsupported => false,

        // All other codes: fatal
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_exponential_growth() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(30),
            2.0,
            0.0,
        );
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            0.0,
        );
        assert_eq!(policy.backoff(10), Duration::from_secs(1));
        assert_eq!(policy.backoff(10_000), Duration::from_secs(1));
    }

    #[test]
    fn test_jittered_backoff_stays_in_band() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1000),
            Duration::from_secs(30),
            2.0,
            0.25,
        );
        for _ in 0..100 {
            let delay = policy.jittered_backoff(0);
            assert!(delay >= Duration::from_millis(750), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1250), "{:?}", delay);
        }
    }

    #[test]
    fn test_backoff_first_attempt_is_immediate_and_reset() {
        let mut backoff = Backoff::new(RetryPolicy::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            2.0,
            0.0,
        ));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.attempts(), 3);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::Overloaded));
        assert!(is_retryable_status(StatusCode::SessionBusy));
        assert!(is_retryable_status(StatusCode::Unavailable));
        assert!(is_retryable_status(StatusCode::InternalError));
    }

    #[test]
    fn test_fatal_statuses() {
        assert!(!is_retryable_status(StatusCode::SchemeError));
        assert!(!is_retryable_status(StatusCode::BadRequest));
        assert!(!is_retryable_status(StatusCode::Unauthorized));
        assert!(!is_retryable_status(StatusCode::Unsupported));
        assert!(!is_retryable_status(StatusCode::Unspecified));
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"backoff_multiplier": 3.0}"#).unwrap();
        assert_eq!(policy.backoff_multiplier, 3.0);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
    }
}
