use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A concurrent histogram storing count and sum only.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Sum of recorded durations in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Dispatcher metrics (internal state) ---

/// Counters shared by every kind loop of one dispatcher.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct DispatchMetrics {
  // Counters
  /// Jobs handed to this dispatcher by the store.
  pub jobs_claimed: Arc<AtomicUsize>,
  pub jobs_completed: Arc<AtomicUsize>,
  /// Handler returned an error.
  pub jobs_failed_attempts: Arc<AtomicUsize>,
  pub jobs_panicked: Arc<AtomicUsize>,
  pub jobs_timed_out: Arc<AtomicUsize>,
  /// Failures that moved a job to `retry`.
  pub jobs_retried: Arc<AtomicUsize>,
  /// Failures that moved a job to `failed`.
  pub jobs_permanently_failed: Arc<AtomicUsize>,
  /// Outcome writes rejected because the claim was no longer current.
  pub stale_outcomes: Arc<AtomicUsize>,
  /// Claim or outcome writes that failed in the store.
  pub store_errors: Arc<AtomicUsize>,

  // Gauges
  pub handlers_active_current: Arc<AtomicUsize>,

  // Histograms
  pub handler_duration: Arc<SimpleHistogram>,
  /// Time from `not_before` to claim.
  pub queue_wait_duration: Arc<SimpleHistogram>,
}

impl DispatchMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      jobs_claimed: self.jobs_claimed.load(order),
      jobs_completed: self.jobs_completed.load(order),
      jobs_failed_attempts: self.jobs_failed_attempts.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      jobs_timed_out: self.jobs_timed_out.load(order),
      jobs_retried: self.jobs_retried.load(order),
      jobs_permanently_failed: self.jobs_permanently_failed.load(order),
      stale_outcomes: self.stale_outcomes.load(order),
      store_errors: self.store_errors.load(order),
      handlers_active_current: self.handlers_active_current.load(order),
      handler_duration_count: self.handler_duration.get_count(),
      handler_duration_sum_micros: self.handler_duration.get_sum_micros(),
      queue_wait_count: self.queue_wait_duration.get_count(),
      queue_wait_sum_micros: self.queue_wait_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot (public data) ---

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_claimed: usize,
  pub jobs_completed: usize,
  pub jobs_failed_attempts: usize,
  pub jobs_panicked: usize,
  pub jobs_timed_out: usize,
  pub jobs_retried: usize,
  pub jobs_permanently_failed: usize,
  pub stale_outcomes: usize,
  pub store_errors: usize,
  // Gauges
  pub handlers_active_current: usize,
  // Histogram data
  pub handler_duration_count: usize,
  pub handler_duration_sum_micros: usize,
  pub queue_wait_count: usize,
  pub queue_wait_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean handler duration, `None` before the first handler finished.
  pub fn mean_handler_duration(&self) -> Option<Duration> {
    if self.handler_duration_count == 0 {
      None
    } else {
      let mean = self.handler_duration_sum_micros as f64 / self.handler_duration_count as f64;
      Some(Duration::from_micros(mean as u64))
    }
  }
}
