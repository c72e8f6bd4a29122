//! tests/publish.rs
//! Tests for publishing: ids, singleton keys, validation and options.

mod common;
use crate::common::{cleanup, memory_builder, monthly_report, setup_tracing, started_queue, welcome};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use jobkeeper::{
  HandlerTable, JobError, JobKind, JobOptions, JobPayload, JobState, StoreError, ValidationError,
};
use serde_json::json;

#[tokio::test]
async fn test_publish_without_singleton_key_returns_distinct_ids() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;

  let first = queue.publish(cleanup(500), JobOptions::new()).await.unwrap();
  let second = queue.publish(cleanup(500), JobOptions::new()).await.unwrap();

  assert_ne!(first, second, "Each publish should create a new job");
  let jobs = store.jobs();
  assert_eq!(jobs.len(), 2);
  assert!(jobs.iter().all(|j| j.state == JobState::Created));
  assert!(jobs.iter().all(|j| j.kind() == JobKind::CleanupExpiredSessions));
}

#[tokio::test]
async fn test_singleton_key_returns_existing_job() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let options = JobOptions::new().singleton_key("user-42-monthly");

  let first = queue.publish(monthly_report("42"), options.clone()).await.unwrap();
  let second = queue.publish(monthly_report("42"), options).await.unwrap();

  assert_eq!(first, second, "Second publish should return the first job's id");
  assert_eq!(store.jobs().len(), 1, "Only one job should be stored");
}

#[tokio::test]
async fn test_singleton_key_is_scoped_per_kind() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let options = JobOptions::new().singleton_key("shared-key");

  let report = queue.publish(monthly_report("42"), options.clone()).await.unwrap();
  let email = queue.publish(welcome("42"), options).await.unwrap();

  assert_ne!(report, email);
  assert_eq!(store.jobs().len(), 2);
}

#[tokio::test]
async fn test_singleton_key_released_once_job_is_terminal() {
  setup_tracing();
  let (queue, _store) = started_queue(HandlerTable::logging()).await;
  let options = JobOptions::new().singleton_key("nightly");

  let first = queue.publish(cleanup(10), options.clone()).await.unwrap();
  queue.cancel(first).await.unwrap();
  let second = queue.publish(cleanup(10), options).await.unwrap();

  assert_ne!(first, second, "A terminal job no longer holds its singleton key");
}

#[tokio::test]
async fn test_concurrent_singleton_publishes_store_one_job() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let queue = Arc::new(queue);

  let mut tasks = Vec::new();
  for _ in 0..10 {
    let queue = queue.clone();
    tasks.push(tokio::spawn(async move {
      queue
        .publish(monthly_report("7"), JobOptions::new().singleton_key("user-7-monthly"))
        .await
    }));
  }

  let mut ids = HashSet::new();
  for task in tasks {
    ids.insert(task.await.unwrap().unwrap());
  }
  assert_eq!(ids.len(), 1, "All publishers should see the same job id");
  assert_eq!(store.jobs().len(), 1);
}

#[tokio::test]
async fn test_invalid_payload_is_rejected_before_store() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let mut payload = welcome("1");
  payload.email = "not-an-address".to_string();

  let result = queue.publish(payload, JobOptions::new()).await;

  assert!(matches!(
    result,
    Err(JobError::Validation(ValidationError::InvalidPayload {
      kind: JobKind::WelcomeEmail,
      ..
    }))
  ));
  assert!(store.jobs().is_empty(), "Nothing should be stored");
}

#[tokio::test]
async fn test_report_with_inverted_date_range_is_rejected() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let mut payload = monthly_report("1");
  std::mem::swap(&mut payload.date_from, &mut payload.date_to);

  let result = queue.publish(payload, JobOptions::new()).await;

  assert!(matches!(result, Err(JobError::Validation(_))));
  assert!(store.jobs().is_empty());
}

#[tokio::test]
async fn test_publish_before_start_is_not_initialized() {
  setup_tracing();
  let (builder, store) = memory_builder();
  let queue = builder.build();

  let result = queue.publish(cleanup(1), JobOptions::new()).await;

  assert_eq!(result, Err(JobError::NotInitialized));
  assert!(store.jobs().is_empty());
}

#[tokio::test]
async fn test_publish_to_unreachable_store_fails() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  store.set_reachable(false);

  let result = queue.publish(cleanup(1), JobOptions::new()).await;

  assert!(matches!(
    result,
    Err(JobError::Publish(StoreError::Unreachable(_)))
  ));
  store.set_reachable(true);
  assert!(store.jobs().is_empty());
}

#[tokio::test]
async fn test_publish_json_parses_against_kind_schema() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;

  let id = queue
    .publish_json(
      "cleanup.expired-sessions",
      json!({ "batchSize": 500 }),
      JobOptions::new(),
    )
    .await
    .unwrap();

  let job = store.jobs().into_iter().find(|j| j.id == id).unwrap();
  assert_eq!(job.payload, JobPayload::from(cleanup(500)));
}

#[tokio::test]
async fn test_publish_json_rejects_unknown_kind_and_bad_shape() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;

  let unknown = queue
    .publish_json("video.transcode", json!({}), JobOptions::new())
    .await;
  assert_eq!(
    unknown,
    Err(JobError::Validation(ValidationError::UnknownKind(
      "video.transcode".to_string()
    )))
  );

  let bad_shape = queue
    .publish_json("backup.database", json!({ "type": "differential" }), JobOptions::new())
    .await;
  assert!(matches!(
    bad_shape,
    Err(JobError::Validation(ValidationError::InvalidPayload { .. }))
  ));

  let unknown_field = queue
    .publish_json(
      "cleanup.expired-sessions",
      json!({ "batchSize": 5, "dryRun": true }),
      JobOptions::new(),
    )
    .await;
  assert!(matches!(unknown_field, Err(JobError::Validation(_))));

  assert!(store.jobs().is_empty());
}

#[tokio::test]
async fn test_options_override_kind_defaults() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let start_at = Utc::now() + ChronoDuration::minutes(5);

  let id = queue
    .publish(
      cleanup(1),
      JobOptions::new()
        .priority(9)
        .start_after(start_at)
        .retry_limit(1)
        .retry_delay(StdDuration::from_secs(5))
        .expire_in(StdDuration::from_secs(60 * 60)),
    )
    .await
    .unwrap();

  let job = store.jobs().into_iter().find(|j| j.id == id).unwrap();
  assert_eq!(job.priority, 9);
  assert_eq!(job.not_before, start_at);
  assert_eq!(job.retry.limit, 1);
  assert_eq!(job.retry.delay_base, StdDuration::from_secs(5));
  assert!(!job.retry.backoff, "Unset options keep the registry default");
  assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn test_deadline_before_start_is_rejected() {
  setup_tracing();
  let (queue, store) = started_queue(HandlerTable::logging()).await;
  let now = Utc::now();

  let result = queue
    .publish(
      cleanup(1),
      JobOptions::new()
        .start_after(now + ChronoDuration::hours(2))
        .expires_at(now + ChronoDuration::hours(1)),
    )
    .await;

  assert!(matches!(
    result,
    Err(JobError::Validation(ValidationError::InvalidOption(_)))
  ));
  assert!(store.jobs().is_empty());
}
