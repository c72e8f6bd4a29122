//! Retry/backoff decisions.
//!
//! Pure functions of the job's retry policy, its attempt count and the
//! current time. The dispatcher applies the resulting [`FailureDecision`]
//! through the store.

use crate::job::Job;

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

/// Upper bound for a single retry delay, however many attempts have failed.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Retry policy carried by every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Number of retries allowed after the first attempt. A job is attempted
  /// at most `limit + 1` times.
  pub limit: u32,
  /// Delay before the first retry.
  pub delay_base: Duration,
  /// Double the delay for every further retry.
  pub backoff: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      limit: 3,
      delay_base: Duration::from_secs(60),
      backoff: true,
    }
  }
}

impl RetryPolicy {
  /// Delay to wait after attempt number `attempt` (1-based) failed.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    if !self.backoff {
      return self.delay_base.min(MAX_RETRY_DELAY);
    }
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << exponent;
    self
      .delay_base
      .checked_mul(factor)
      .unwrap_or(MAX_RETRY_DELAY)
      .min(MAX_RETRY_DELAY)
  }

  /// Whether another attempt is allowed after `attempts` claims.
  pub fn has_retries_left(&self, attempts: u32) -> bool {
    attempts <= self.limit
  }
}

/// What happens to a job whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
  /// Back to `retry`, claimable again from `not_before`.
  Retry { not_before: DateTime<Utc>, delay: Duration },
  /// Retry budget exhausted; `failed` is terminal.
  Fail,
}

/// Decides the transition for a failed attempt.
///
/// `attempts` is the job's claim count including the attempt that failed.
pub fn decide_on_failure(policy: &RetryPolicy, attempts: u32, now: DateTime<Utc>) -> FailureDecision {
  if !policy.has_retries_left(attempts) {
    return FailureDecision::Fail;
  }
  let delay = policy.delay_after(attempts);
  let not_before = ChronoDuration::from_std(delay)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .unwrap_or_else(|| {
      warn!(?delay, attempt = attempts, "Retry delay overflowed, retrying immediately.");
      now
    });
  FailureDecision::Retry { not_before, delay }
}

/// Whether `job` has passed its deadline while still non-terminal.
pub fn is_expired(job: &Job, now: DateTime<Utc>) -> bool {
  !job.state.is_terminal() && job.expires_at <= now
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy(limit: u32, base_secs: u64, backoff: bool) -> RetryPolicy {
    RetryPolicy {
      limit,
      delay_base: Duration::from_secs(base_secs),
      backoff,
    }
  }

  #[test]
  fn exponential_backoff_doubles_per_attempt() {
    let p = policy(5, 60, true);
    assert_eq!(p.delay_after(1), Duration::from_secs(60));
    assert_eq!(p.delay_after(2), Duration::from_secs(120));
    assert_eq!(p.delay_after(3), Duration::from_secs(240));
  }

  #[test]
  fn fixed_delay_when_backoff_disabled() {
    let p = policy(5, 60, false);
    for attempt in 1..6 {
      assert_eq!(p.delay_after(attempt), Duration::from_secs(60));
    }
  }

  #[test]
  fn backoff_is_capped_and_monotonic() {
    let p = policy(u32::MAX, 60, true);
    let mut previous = Duration::ZERO;
    for attempt in 1..200 {
      let delay = p.delay_after(attempt);
      assert!(delay >= previous, "delay decreased at attempt {attempt}");
      assert!(delay <= MAX_RETRY_DELAY);
      previous = delay;
    }
    assert_eq!(p.delay_after(199), MAX_RETRY_DELAY);
  }

  #[test]
  fn retry_limit_allows_limit_plus_one_attempts() {
    let p = policy(3, 1, true);
    let now = Utc::now();
    for attempt in 1..=3 {
      assert!(matches!(decide_on_failure(&p, attempt, now), FailureDecision::Retry { .. }));
    }
    assert_eq!(decide_on_failure(&p, 4, now), FailureDecision::Fail);
  }

  #[test]
  fn zero_retry_limit_fails_on_first_error() {
    let p = policy(0, 60, true);
    assert_eq!(decide_on_failure(&p, 1, Utc::now()), FailureDecision::Fail);
  }

  #[test]
  fn retry_time_is_now_plus_delay() {
    let p = policy(3, 60, true);
    let now = Utc::now();
    match decide_on_failure(&p, 2, now) {
      FailureDecision::Retry { not_before, delay } => {
        assert_eq!(delay, Duration::from_secs(120));
        assert_eq!(not_before, now + ChronoDuration::seconds(120));
      }
      FailureDecision::Fail => panic!("expected a retry"),
    }
  }
}
