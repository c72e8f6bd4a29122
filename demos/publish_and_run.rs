//! demos/publish_and_run.rs
//!
//! Publishes a few one-off jobs to an in-memory queue, runs a worker until
//! they finish, and shuts down gracefully.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobkeeper::job::{CleanupExpiredSessions, WelcomeEmail};
use jobkeeper::store::{MemoryConnector, MemoryStore};
use jobkeeper::telemetry::{init_tracing, LogFormat};
use jobkeeper::{handler_fn, HandlerError, HandlerTable, JobOptions, JobQueue, JobState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  init_tracing("warn,jobkeeper=info,publish_and_run=info", LogFormat::Pretty);

  // --- Handlers ---
  let cleaned = Arc::new(AtomicUsize::new(0));
  let counter = cleaned.clone();
  let handlers = HandlerTable::logging()
    .on_cleanup_expired_sessions(handler_fn! {
      { let counter = counter.clone(); }
      |run| {
        info!(job_id = %run.id, batch = run.payload.batch_size(), "Cleaning expired sessions");
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), HandlerError>(())
      }
    })
    .on_welcome_email(handler_fn! {
      |run| {
        // Fails once, then succeeds on the retry.
        if run.attempts == 1 {
          return Err(HandlerError::failed("mail server busy"));
        }
        info!(job_id = %run.id, to = %run.payload.email, attempt = run.attempts, "Welcome email sent");
        Ok::<(), HandlerError>(())
      }
    });

  // --- Build and start ---
  let store = MemoryStore::new();
  let queue = JobQueue::builder(MemoryConnector::new(store.clone()))
    .handlers(handlers)
    .shutdown_grace(StdDuration::from_secs(5))
    .build();
  queue.start().await?;
  let dispatcher = queue.start_worker()?;

  // --- Publish ---
  let mut ids = Vec::new();
  for batch in [100, 500, 1000] {
    let payload = CleanupExpiredSessions {
      batch_size: Some(batch),
      older_than_days: None,
    };
    ids.push(queue.publish(payload, JobOptions::new()).await?);
  }
  let email = WelcomeEmail {
    user_id: "user-42".to_string(),
    email: "new.user@example.com".to_string(),
    locale: "en-GB".to_string(),
  };
  ids.push(
    queue
      .publish(email, JobOptions::new().priority(5).retry_delay(StdDuration::from_millis(200)))
      .await?,
  );
  info!(count = ids.len(), "Jobs published");

  // --- Wait for them to finish ---
  let deadline = tokio::time::Instant::now() + StdDuration::from_secs(15);
  loop {
    let mut pending = 0;
    for id in &ids {
      match queue.job_status(*id).await? {
        Some(job) if job.state.is_terminal() => {}
        _ => pending += 1,
      }
    }
    if pending == 0 {
      break;
    }
    if tokio::time::Instant::now() >= deadline {
      warn!(pending, "Gave up waiting for jobs");
      break;
    }
    tokio::time::sleep(StdDuration::from_millis(100)).await;
  }

  for job in store.jobs() {
    info!(job_id = %job.id, kind = %job.kind(), state = %job.state, attempts = job.attempts, "Final state");
  }
  info!("Metrics: {:#?}", dispatcher.metrics());
  info!("Status: {}", serde_json::to_string_pretty(&queue.status().await?)?);

  // --- Shutdown ---
  drop(dispatcher);
  let outcome = queue.shutdown().await;
  info!(?outcome, "Queue shut down");

  assert_eq!(cleaned.load(Ordering::SeqCst), 3);
  assert!(store.jobs().iter().all(|job| job.state == JobState::Completed));
  Ok(())
}
