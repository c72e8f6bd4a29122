//! demos/recurring_schedule.rs
//!
//! Registers recurring schedules on an in-memory queue, lets maintenance
//! materialize a few ticks, then shuts down on Ctrl+C or after a fixed time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobkeeper::job::{BackupDatabase, BackupType, CleanupExpiredSessions};
use jobkeeper::store::{MemoryConnector, MemoryStore};
use jobkeeper::telemetry::{init_tracing, LogFormat};
use jobkeeper::{
  handler_fn, HandlerError, HandlerTable, JobQueue, KindSettings, Registry, ShutdownSignal,
};
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  init_tracing("warn,jobkeeper=info,recurring_schedule=info", LogFormat::Pretty);

  let runs = Arc::new(AtomicUsize::new(0));
  let counter = runs.clone();
  let handlers = HandlerTable::logging().on_cleanup_expired_sessions(handler_fn! {
    { let counter = counter.clone(); }
    |run| {
      let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
      info!(job_id = %run.id, run = n, "Recurring cleanup ran");
      Ok::<(), HandlerError>(())
    }
  });

  // Poll quickly so materialized ticks are picked up within the demo.
  let settings = KindSettings {
    poll_interval: StdDuration::from_millis(200),
    ..KindSettings::default()
  };
  let queue = JobQueue::builder(MemoryConnector::new(MemoryStore::new()))
    .registry(Registry::uniform(Default::default(), settings))
    .handlers(handlers)
    .maintenance_interval(StdDuration::from_millis(500))
    .shutdown_grace(StdDuration::from_secs(5))
    .build();
  queue.start().await?;

  // Six-field expressions carry seconds: every two seconds.
  queue
    .schedule_recurring(CleanupExpiredSessions::default(), "*/2 * * * * *", "UTC")
    .await?;
  // Crontab numbering: 0 is Sunday.
  queue
    .schedule_recurring(
      BackupDatabase {
        backup_type: BackupType::Full,
        retention_days: Some(30),
      },
      "0 1 * * 0",
      "Europe/Berlin",
    )
    .await?;
  // Re-registering is idempotent.
  let again = queue
    .schedule_recurring(CleanupExpiredSessions::default(), "*/2 * * * * *", "UTC")
    .await?;
  info!(?again, "Registered the cleanup schedule a second time");

  for schedule in queue.list_schedules().await? {
    info!(
      kind = %schedule.kind(),
      cron = %schedule.cron_expression,
      timezone = %schedule.timezone,
      next_run_at = %schedule.next_run_at,
      "Schedule"
    );
  }

  queue.start_worker()?;

  // Ctrl+C ends the demo early; otherwise stop after ten seconds.
  let (tx, rx) = mpsc::channel(4);
  tokio::spawn(async move {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {}
      _ = tokio::time::sleep(StdDuration::from_secs(10)) => {}
    }
    let _ = tx.send(ShutdownSignal::Interrupt).await;
  });
  let outcome = queue.run_until_signalled(rx).await;

  info!(?outcome, runs = runs.load(Ordering::SeqCst), "Demo finished");
  std::process::exit(outcome.exit_code());
}
