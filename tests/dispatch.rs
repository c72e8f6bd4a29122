//! tests/dispatch.rs
//! Tests for the worker: claiming, ordering, concurrency and handler plumbing.

mod common;
use crate::common::{
  cleanup, concurrency_tracking_handlers, fast_defaults, fast_settings, full_backup, job,
  memory_builder, recording_handlers, setup_tracing, wait_for_state, wait_until, welcome,
};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use jobkeeper::job::{CleanupExpiredSessions, WelcomeEmail};
use jobkeeper::{
  handler_fn, HandlerError, HandlerTable, JobError, JobKind, JobOptions, JobPayload, JobRun,
  JobState, KindSettings, Registry,
};
use parking_lot::Mutex;

#[tokio::test]
async fn test_worker_runs_published_job_to_completion() {
  setup_tracing();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (builder, store) = memory_builder();
  let queue = builder.handlers(recording_handlers(seen.clone())).build();
  queue.start().await.unwrap();
  queue.start_worker().unwrap();

  let id = queue.publish(cleanup(500), JobOptions::new()).await.unwrap();

  assert!(wait_for_state(&store, id, JobState::Completed).await, "Job should complete");
  let seen = seen.lock().clone();
  assert_eq!(seen, vec![(JobPayload::from(cleanup(500)), 1)]);

  let completed = job(&store, id).unwrap();
  assert_eq!(completed.attempts, 1);
  assert_eq!(completed.claimed_by.as_deref(), Some("test-worker"));
  assert!(completed.completed_at.is_some());
  assert!(completed.lease_expires_at.is_none());

  let dispatcher = queue.dispatcher().unwrap();
  assert!(
    wait_until(StdDuration::from_secs(1), || {
      let done = dispatcher.metrics().jobs_completed;
      async move { done == 1 }
    })
    .await
  );
  let metrics = dispatcher.metrics();
  assert_eq!(metrics.jobs_claimed, 1);
  assert_eq!(metrics.jobs_completed, 1);
  assert_eq!(metrics.jobs_failed_attempts, 0);
  assert!(metrics.mean_handler_duration().is_some());
  drop(dispatcher);

  assert_eq!(queue.shutdown().await, jobkeeper::ShutdownOutcome::Graceful);
}

#[tokio::test]
async fn test_start_worker_before_connection_fails() {
  setup_tracing();
  let (builder, _store) = memory_builder();
  let queue = builder.build();

  assert!(matches!(queue.start_worker(), Err(JobError::NotInitialized)));
}

#[tokio::test]
async fn test_start_worker_is_idempotent() {
  setup_tracing();
  let (builder, _store) = memory_builder();
  let queue = builder.build();
  queue.start().await.unwrap();

  let first = queue.start_worker().unwrap();
  let second = queue.start_worker().unwrap();

  assert!(Arc::ptr_eq(&first, &second));
  queue.shutdown().await;
}

#[tokio::test]
async fn test_higher_priority_runs_first_then_fifo() {
  setup_tracing();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let serial = KindSettings {
    batch_size: 1,
    concurrency: 1,
    ..fast_settings()
  };
  let (builder, store) = memory_builder();
  let queue = builder
    .registry(Registry::uniform(fast_defaults(), serial))
    .handlers(recording_handlers(seen.clone()))
    .build();
  queue.start().await.unwrap();

  queue.publish(cleanup(1), JobOptions::new()).await.unwrap();
  queue.publish(cleanup(2), JobOptions::new()).await.unwrap();
  let urgent = queue
    .publish(cleanup(3), JobOptions::new().priority(10))
    .await
    .unwrap();
  queue.start_worker().unwrap();

  assert!(
    wait_until(StdDuration::from_secs(5), || {
      let done = seen.lock().len();
      async move { done == 3 }
    })
    .await
  );
  let order: Vec<JobPayload> = seen.lock().iter().map(|(p, _)| p.clone()).collect();
  assert_eq!(
    order,
    vec![
      JobPayload::from(cleanup(3)),
      JobPayload::from(cleanup(1)),
      JobPayload::from(cleanup(2)),
    ]
  );
  assert_eq!(job(&store, urgent).unwrap().state, JobState::Completed);
  queue.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
  setup_tracing();
  let active = Arc::new(AtomicUsize::new(0));
  let max_observed = Arc::new(AtomicUsize::new(0));
  let completed = Arc::new(AtomicUsize::new(0));
  let limited = KindSettings {
    concurrency: 2,
    ..fast_settings()
  };
  let (builder, _store) = memory_builder();
  let queue = builder
    .registry(Registry::uniform(fast_defaults(), limited))
    .handlers(concurrency_tracking_handlers(
      active.clone(),
      max_observed.clone(),
      completed.clone(),
      StdDuration::from_millis(100),
    ))
    .build();
  queue.start().await.unwrap();

  for i in 0..6 {
    queue.publish(cleanup(i + 1), JobOptions::new()).await.unwrap();
  }
  queue.start_worker().unwrap();

  assert!(
    wait_until(StdDuration::from_secs(5), || {
      let done = completed.load(Ordering::SeqCst);
      async move { done == 6 }
    })
    .await,
    "All jobs should complete"
  );
  let max = max_observed.load(Ordering::SeqCst);
  assert!(max <= 2, "At most 2 handlers of one kind at once, saw {max}");
  assert_eq!(max, 2, "Both slots should have been used");
  queue.shutdown().await;
}

#[tokio::test]
async fn test_delayed_job_waits_for_start_time() {
  setup_tracing();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (builder, store) = memory_builder();
  let queue = builder.handlers(recording_handlers(seen.clone())).build();
  queue.start().await.unwrap();
  queue.start_worker().unwrap();

  let id = queue
    .publish(
      cleanup(1),
      JobOptions::new().start_after(Utc::now() + ChronoDuration::milliseconds(400)),
    )
    .await
    .unwrap();

  tokio::time::sleep(StdDuration::from_millis(150)).await;
  assert_eq!(job(&store, id).unwrap().state, JobState::Created, "Should not run early");
  assert!(seen.lock().is_empty());

  assert!(wait_for_state(&store, id, JobState::Completed).await);
  queue.shutdown().await;
}

#[tokio::test]
async fn test_only_kinds_restricts_dispatch() {
  setup_tracing();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (builder, store) = memory_builder();
  let queue = builder
    .handlers(recording_handlers(seen.clone()))
    .only_kinds([JobKind::BackupDatabase])
    .build();
  queue.start().await.unwrap();
  queue.start_worker().unwrap();

  let email = queue.publish(welcome("9"), JobOptions::new()).await.unwrap();
  let backup = queue.publish(full_backup(), JobOptions::new()).await.unwrap();

  assert!(wait_for_state(&store, backup, JobState::Completed).await);
  tokio::time::sleep(StdDuration::from_millis(100)).await;
  assert_eq!(job(&store, email).unwrap().state, JobState::Created);
  queue.shutdown().await;
}

#[tokio::test]
async fn test_typed_handlers_receive_their_payload() {
  setup_tracing();
  let emails = Arc::new(Mutex::new(Vec::<String>::new()));
  let handlers = HandlerTable::logging().on_welcome_email({
    let emails = emails.clone();
    move |run: JobRun<WelcomeEmail>| {
      let emails = emails.clone();
      async move {
        emails.lock().push(run.payload.email);
        Ok::<(), HandlerError>(())
      }
    }
  });
  let (builder, store) = memory_builder();
  let queue = builder.handlers(handlers).build();
  queue.start().await.unwrap();
  queue.start_worker().unwrap();

  let id = queue.publish(welcome("ada"), JobOptions::new()).await.unwrap();

  assert!(wait_for_state(&store, id, JobState::Completed).await);
  assert_eq!(emails.lock().clone(), vec!["ada@example.com".to_string()]);
  queue.shutdown().await;
}

#[tokio::test]
async fn test_handler_fn_macro_with_setup_block() {
  setup_tracing();
  let batches = Arc::new(AtomicUsize::new(0));
  let counter = batches.clone();
  let handlers = HandlerTable::logging().on_cleanup_expired_sessions(handler_fn! {
    { let counter = counter.clone(); }
    |run| {
      let payload: CleanupExpiredSessions = run.payload;
      counter.fetch_add(payload.batch_size() as usize, Ordering::SeqCst);
      Ok::<(), HandlerError>(())
    }
  });
  let (builder, store) = memory_builder();
  let queue = builder.handlers(handlers).build();
  queue.start().await.unwrap();
  queue.start_worker().unwrap();

  let id = queue.publish(cleanup(250), JobOptions::new()).await.unwrap();

  assert!(wait_for_state(&store, id, JobState::Completed).await);
  assert_eq!(batches.load(Ordering::SeqCst), 250);
  queue.shutdown().await;
}

#[cfg(feature = "job_context")]
#[tokio::test]
async fn test_job_context_is_available_inside_handler() {
  use jobkeeper::{job_context, try_get_current_job_context, JobContext};

  setup_tracing();
  assert!(try_get_current_job_context().is_none(), "No context outside handlers");

  let captured: Arc<Mutex<Option<JobContext>>> = Arc::new(Mutex::new(None));
  let sink = captured.clone();
  let handlers = HandlerTable::logging().on_backup_database(handler_fn! {
    { let sink = sink.clone(); }
    |run| {
      let ctx = job_context!();
      assert_eq!(ctx.job_id, run.id);
      *sink.lock() = try_get_current_job_context();
      Ok::<(), HandlerError>(())
    }
  });
  let (builder, store) = memory_builder();
  let queue = builder.handlers(handlers).build();
  queue.start().await.unwrap();
  queue.start_worker().unwrap();

  let id = queue.publish(full_backup(), JobOptions::new()).await.unwrap();

  assert!(wait_for_state(&store, id, JobState::Completed).await);
  let ctx = captured.lock().clone().expect("Handler should have seen a context");
  assert_eq!(ctx.job_id, id);
  assert_eq!(ctx.kind, JobKind::BackupDatabase);
  assert_eq!(ctx.attempt, 1);
  assert_eq!(ctx.worker_id, "test-worker");
  queue.shutdown().await;
}
