//! Periodic liveness reporting.

use crate::connection::ConnectionManager;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Jobs occupying the queue at the time of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
  pub active: u64,
  pub retry: u64,
}

impl QueueDepth {
  pub fn total(&self) -> u64 {
    self.active + self.retry
  }
}

/// Result of one health check. Serializes as
/// `{"healthy":..,"timestamp":"<RFC 3339>","error":..,"queue":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
  pub healthy: bool,
  pub timestamp: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub queue: Option<QueueDepth>,
}

impl HealthReport {
  fn unhealthy(error: impl Into<String>) -> Self {
    Self {
      healthy: false,
      timestamp: Utc::now(),
      error: Some(error.into()),
      queue: None,
    }
  }
}

#[derive(Debug, Clone)]
struct Checker {
  connection: Arc<ConnectionManager>,
  max_queue_depth: Option<u64>,
  latest: Arc<RwLock<Option<HealthReport>>>,
}

impl Checker {
  async fn check(&self) -> HealthReport {
    let report = self.evaluate().await;
    if report.healthy {
      debug!(queue = ?report.queue, "Health check passed.");
    } else {
      warn!(error = report.error.as_deref().unwrap_or(""), "Health check failed.");
    }
    *self.latest.write() = Some(report.clone());
    report
  }

  async fn evaluate(&self) -> HealthReport {
    let handle = match self.connection.handle() {
      Ok(handle) => handle,
      Err(_) => return HealthReport::unhealthy("Job queue not initialized"),
    };
    let store = handle.store();
    if let Err(e) = store.ping().await {
      return HealthReport::unhealthy(e.to_string());
    }
    let counts = match store.count_by_state().await {
      Ok(counts) => counts,
      Err(e) => return HealthReport::unhealthy(e.to_string()),
    };

    let queue = QueueDepth {
      active: counts.active,
      retry: counts.retry,
    };
    let error = match self.max_queue_depth {
      Some(max) if queue.total() > max => Some(format!(
        "queue depth {} exceeds the maximum of {max}",
        queue.total()
      )),
      _ => None,
    };
    HealthReport {
      healthy: error.is_none(),
      timestamp: Utc::now(),
      error,
      queue: Some(queue),
    }
  }
}

/// Checks the store on a fixed interval and keeps the latest report.
///
/// A check never fails; problems are reported as `healthy: false`.
#[derive(Debug)]
pub struct HealthMonitor {
  checker: Checker,
  interval: Duration,
  running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl HealthMonitor {
  pub fn new(connection: Arc<ConnectionManager>, interval: Duration) -> Self {
    Self {
      checker: Checker {
        connection,
        max_queue_depth: None,
        latest: Arc::new(RwLock::new(None)),
      },
      interval,
      running: Mutex::new(None),
    }
  }

  /// Reports unhealthy when `active + retry` exceeds `max`.
  pub fn max_queue_depth(mut self, max: u64) -> Self {
    self.checker.max_queue_depth = Some(max);
    self
  }

  /// Runs a check now and records it as the latest report.
  pub async fn check(&self) -> HealthReport {
    self.checker.check().await
  }

  pub fn latest(&self) -> Option<HealthReport> {
    self.checker.latest.read().clone()
  }

  /// Starts periodic checks, the first one immediately. No-op if running.
  pub fn start(&self) {
    let mut running = self.running.lock();
    if running.is_some() {
      return;
    }
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let checker = self.checker.clone();
    let period = self.interval;

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          biased;
          _ = stop_rx.changed() => break,
          _ = ticker.tick() => {
            checker.check().await;
          }
        }
      }
    });
    *running = Some((stop_tx, task));
    info!(interval = ?self.interval, "Health monitor started.");
  }

  /// Stops the timer. Idempotent.
  pub async fn stop(&self) {
    let Some((stop_tx, task)) = self.running.lock().take() else {
      return;
    };
    let _ = stop_tx.send(true);
    if let Err(e) = task.await {
      warn!(error = %e, "Health monitor task ended abnormally.");
    }
    info!("Health monitor stopped.");
  }

  pub fn is_running(&self) -> bool {
    self.running.lock().is_some()
  }
}
