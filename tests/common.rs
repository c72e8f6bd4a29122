//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing_subscriber::fmt::TestWriter;

use jobkeeper::job::{
  BackupDatabase, BackupType, CleanupExpiredSessions, ReportFormat, ReportGenerate, WelcomeEmail,
};
use jobkeeper::store::{MemoryConnector, MemoryStore};
use jobkeeper::{
  HandlerError, HandlerTable, Job, JobDefaults, JobId, JobPayload, JobQueue, JobQueueBuilder,
  JobState, KindSettings, Registry, RetryPolicy,
};

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG) // Show debug logs from the dispatcher
    .with_writer(TestWriter::new()) // Write to test output
    .with_test_writer() // Enable per-test log capture
    .try_init();
}

// Publish defaults with short retry delays so retries happen within a test.
pub fn fast_defaults() -> JobDefaults {
  JobDefaults {
    priority: 0,
    retry: RetryPolicy {
      limit: 3,
      delay_base: StdDuration::from_millis(10),
      backoff: false,
    },
    expire_in: StdDuration::from_secs(60 * 60),
  }
}

// Dispatch settings that poll often.
pub fn fast_settings() -> KindSettings {
  KindSettings {
    batch_size: 5,
    poll_interval: StdDuration::from_millis(20),
    concurrency: 5,
    lease_duration: StdDuration::from_secs(30),
    handler_timeout: None,
  }
}

pub fn fast_registry() -> Registry {
  Registry::uniform(fast_defaults(), fast_settings())
}

// Builder over a fresh memory store; the store handle is returned for inspection.
pub fn memory_builder() -> (JobQueueBuilder, MemoryStore) {
  let store = MemoryStore::new();
  let builder = JobQueue::builder(MemoryConnector::new(store.clone()))
    .registry(fast_registry())
    .worker_id("test-worker")
    .shutdown_grace(StdDuration::from_secs(5));
  (builder, store)
}

// A started queue (connection only, no worker) with the given handlers.
pub async fn started_queue(handlers: HandlerTable) -> (JobQueue, MemoryStore) {
  let (builder, store) = memory_builder();
  let queue = builder.handlers(handlers).build();
  queue.start().await.expect("Queue start failed");
  (queue, store)
}

// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: StdDuration, mut condition: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

// Waits until job `id` reaches `state` in `store`.
pub async fn wait_for_state(store: &MemoryStore, id: JobId, state: JobState) -> bool {
  wait_until(StdDuration::from_secs(5), || {
    let found = job(store, id).map(|j| j.state);
    async move { found == Some(state) }
  })
  .await
}

pub fn job(store: &MemoryStore, id: JobId) -> Option<Job> {
  store.jobs().into_iter().find(|j| j.id == id)
}

// --- Payloads ---

pub fn cleanup(batch_size: u32) -> CleanupExpiredSessions {
  CleanupExpiredSessions {
    batch_size: Some(batch_size),
    older_than_days: None,
  }
}

pub fn welcome(user_id: &str) -> WelcomeEmail {
  WelcomeEmail {
    user_id: user_id.to_string(),
    email: format!("{user_id}@example.com"),
    locale: "en".to_string(),
  }
}

pub fn monthly_report(user_id: &str) -> ReportGenerate {
  ReportGenerate {
    report_type: "monthly".to_string(),
    user_id: user_id.to_string(),
    date_from: NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
    date_to: NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date"),
    format: ReportFormat::Pdf,
  }
}

pub fn full_backup() -> BackupDatabase {
  BackupDatabase {
    backup_type: BackupType::Full,
    retention_days: None,
  }
}

// --- Handlers ---

// Every kind succeeds after recording the payload and attempt it saw.
pub fn recording_handlers(seen: Arc<Mutex<Vec<(JobPayload, u32)>>>) -> HandlerTable {
  HandlerTable::from_fn(move |run| {
    let seen = seen.clone();
    async move {
      tracing::debug!(job_id = %run.id, attempt = run.attempts, "Recording handler executing");
      seen.lock().push((run.payload, run.attempts));
      Ok(())
    }
  })
}

// Every kind fails `fail_times` times in total, then succeeds.
pub fn failing_handlers(calls: Arc<AtomicUsize>, fail_times: usize) -> HandlerTable {
  HandlerTable::from_fn(move |run| {
    let calls = calls.clone();
    async move {
      let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(job_id = %run.id, call, "Failing handler executing");
      if call <= fail_times {
        Err(HandlerError::failed(format!("forced failure #{call}")))
      } else {
        Ok(())
      }
    }
  })
}

// Every kind sleeps for `delay`, tracking how many run at once.
pub fn concurrency_tracking_handlers(
  active: Arc<AtomicUsize>,
  max_observed: Arc<AtomicUsize>,
  completed: Arc<AtomicUsize>,
  delay: StdDuration,
) -> HandlerTable {
  HandlerTable::from_fn(move |_run| {
    let active = active.clone();
    let max_observed = max_observed.clone();
    let completed = completed.clone();
    async move {
      let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
      max_observed.fetch_max(now_active, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      active.fetch_sub(1, Ordering::SeqCst);
      completed.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  })
}
