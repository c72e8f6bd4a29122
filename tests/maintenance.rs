//! tests/maintenance.rs
//! Tests for expiry, abandoned leases and reclaiming jobs from crashed workers.

mod common;
use crate::common::{
  cleanup, job, memory_builder, recording_handlers, setup_tracing, started_queue, wait_for_state,
};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use jobkeeper::store::{ClaimRequest, JobStore};
use jobkeeper::{HandlerTable, JobKind, JobOptions, JobState};
use parking_lot::Mutex;

fn crashed_worker_claim(lease: StdDuration) -> ClaimRequest<'static> {
  ClaimRequest {
    kind: JobKind::CleanupExpiredSessions,
    limit: 10,
    lease,
    worker_id: "crashed-worker",
    now: Utc::now(),
  }
}

#[tokio::test]
async fn test_overdue_job_is_expired_by_sweep() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let id = queue
    .publish(cleanup(1), JobOptions::new().expire_in(StdDuration::from_secs(60)))
    .await
    .unwrap();

  let before = queue.run_maintenance(Utc::now()).await.unwrap();
  assert_eq!(before.sweep.expired, 0);

  let report = queue
    .run_maintenance(Utc::now() + ChronoDuration::minutes(2))
    .await
    .unwrap();
  assert_eq!(report.sweep.expired, 1);
  let expired = job(&store, id).unwrap();
  assert_eq!(expired.state, JobState::Expired);
  assert!(expired.completed_at.is_some());
}

#[tokio::test]
async fn test_expired_job_is_never_claimed() {
  setup_tracing();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (builder, store) = memory_builder();
  let queue = builder.handlers(recording_handlers(seen.clone())).build();
  queue.start().await.unwrap();
  let id = queue
    .publish(cleanup(1), JobOptions::new().expire_in(StdDuration::from_millis(30)))
    .await
    .unwrap();
  tokio::time::sleep(StdDuration::from_millis(60)).await;

  queue.start_worker().unwrap();
  tokio::time::sleep(StdDuration::from_millis(200)).await;

  assert!(seen.lock().is_empty(), "Handler must not run for an expired job");
  assert_eq!(job(&store, id).unwrap().attempts, 0);
  queue.shutdown().await;
}

#[tokio::test]
async fn test_job_with_expired_lease_is_reclaimed() {
  setup_tracing();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (builder, store) = memory_builder();
  let queue = builder.handlers(recording_handlers(seen.clone())).build();
  queue.start().await.unwrap();
  let id = queue.publish(cleanup(1), JobOptions::new()).await.unwrap();

  // Another worker claims the job and dies without reporting.
  let claimed = store
    .claim_jobs(crashed_worker_claim(StdDuration::from_millis(50)))
    .await
    .unwrap();
  assert_eq!(claimed.len(), 1);
  let stale_token = claimed[0].claim_token();

  queue.start_worker().unwrap();
  assert!(wait_for_state(&store, id, JobState::Completed).await, "Job should be reclaimed");

  let completed = job(&store, id).unwrap();
  assert_eq!(completed.attempts, 2);
  assert_eq!(completed.claimed_by.as_deref(), Some("test-worker"));
  assert_eq!(seen.lock().len(), 1);

  // The crashed worker's late outcome is ignored.
  assert!(!store.fail_job(stale_token, "late", Utc::now()).await.unwrap());
  assert_eq!(job(&store, id).unwrap().state, JobState::Completed);
  queue.shutdown().await;
}

#[tokio::test]
async fn test_job_within_lease_is_not_reclaimed() {
  setup_tracing();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (builder, store) = memory_builder();
  let queue = builder.handlers(recording_handlers(seen.clone())).build();
  queue.start().await.unwrap();
  let id = queue.publish(cleanup(1), JobOptions::new()).await.unwrap();

  store
    .claim_jobs(crashed_worker_claim(StdDuration::from_secs(60)))
    .await
    .unwrap();
  queue.start_worker().unwrap();
  tokio::time::sleep(StdDuration::from_millis(200)).await;

  assert!(seen.lock().is_empty());
  let held = job(&store, id).unwrap();
  assert_eq!(held.state, JobState::Active);
  assert_eq!(held.claimed_by.as_deref(), Some("crashed-worker"));
  queue.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_job_without_retries_fails_on_sweep() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let id = queue
    .publish(cleanup(1), JobOptions::new().retry_limit(0))
    .await
    .unwrap();
  store
    .claim_jobs(crashed_worker_claim(StdDuration::from_millis(10)))
    .await
    .unwrap();

  let report = queue
    .run_maintenance(Utc::now() + ChronoDuration::seconds(1))
    .await
    .unwrap();

  assert_eq!(report.sweep.abandoned, 1);
  let failed = job(&store, id).unwrap();
  assert_eq!(failed.state, JobState::Failed);
  assert_eq!(
    failed.last_error.as_deref(),
    Some("lease expired after 1 attempts")
  );
}

#[tokio::test]
async fn test_sweep_leaves_live_jobs_alone() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let waiting = queue.publish(cleanup(1), JobOptions::new()).await.unwrap();
  let running = queue.publish(cleanup(2), JobOptions::new()).await.unwrap();
  store.update_job(running, |j| {
    j.state = JobState::Active;
    j.attempts = 1;
    j.lease_expires_at = Some(Utc::now() + ChronoDuration::minutes(10));
  });

  let report = queue.run_maintenance(Utc::now()).await.unwrap();

  assert_eq!(report.sweep.expired, 0);
  assert_eq!(report.sweep.abandoned, 0);
  assert_eq!(job(&store, waiting).unwrap().state, JobState::Created);
  assert_eq!(job(&store, running).unwrap().state, JobState::Active);
}
