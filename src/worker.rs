use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::dispatcher::ShutdownMode;
use crate::error::HandlerError;
use crate::handler::HandlerTable;
use crate::job::{Job, JobKind, WorkerId};
use crate::metrics::DispatchMetrics;
use crate::registry::KindSettings;
use crate::retry::{decide_on_failure, FailureDecision};
use crate::store::ClaimRequest;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Polling loop for one job kind.
///
/// Claims jobs from the store while it has free concurrency slots, runs each
/// handler as its own task, and writes the outcome back under the claim token.
/// On `Graceful` shutdown it stops claiming and waits for its handlers; on
/// `Force` it aborts them, leaving their rows `active` for lease recovery.
pub(crate) struct KindWorker {
  kind: JobKind,
  settings: KindSettings,
  worker_id: WorkerId,
  connection: Arc<ConnectionManager>,
  handlers: Arc<HandlerTable>,
  metrics: DispatchMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  // Handlers running across all kinds of the dispatcher.
  in_flight: Arc<AtomicUsize>,
}

impl KindWorker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    kind: JobKind,
    settings: KindSettings,
    worker_id: WorkerId,
    connection: Arc<ConnectionManager>,
    handlers: Arc<HandlerTable>,
    metrics: DispatchMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    in_flight: Arc<AtomicUsize>,
  ) -> Self {
    Self {
      kind,
      settings,
      worker_id,
      connection,
      handlers,
      metrics,
      shutdown_rx,
      in_flight,
    }
  }

  pub async fn run(mut self) {
    info!(kind = %self.kind, worker_id = %self.worker_id, concurrency = self.settings.concurrency, "Kind worker started.");
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
      while let Some(result) = tasks.try_join_next() {
        self.log_task_exit(result);
      }
      if self.shutdown_mode().is_some() {
        break;
      }

      let free = self.settings.concurrency.saturating_sub(tasks.len());
      let wanted = self.settings.batch_size.min(free);
      let mut claimed_full_batch = false;
      if wanted > 0 {
        let claimed = self.claim(wanted).await;
        claimed_full_batch = claimed.len() == wanted && wanted == self.settings.batch_size;
        for (handle, job) in claimed {
          self.spawn_job(&mut tasks, handle, job);
        }
      }
      if claimed_full_batch && tasks.len() < self.settings.concurrency {
        // More may be waiting; poll again right away.
        continue;
      }

      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {}

        Some(result) = tasks.join_next(), if !tasks.is_empty() => {
          self.log_task_exit(result);
        }

        _ = tokio::time::sleep(self.settings.poll_interval) => {
          trace!(kind = %self.kind, "Poll interval elapsed.");
        }
      }
    }

    self.drain(tasks).await;
    info!(kind = %self.kind, worker_id = %self.worker_id, "Kind worker stopped.");
  }

  fn shutdown_mode(&self) -> Option<ShutdownMode> {
    *self.shutdown_rx.borrow()
  }

  /// Waits for running handlers, aborting them if `Force` is requested.
  async fn drain(&mut self, mut tasks: JoinSet<()>) {
    if tasks.is_empty() {
      return;
    }
    let mut forced = false;
    if self.shutdown_mode() == Some(ShutdownMode::Force) {
      warn!(kind = %self.kind, running = tasks.len(), "Forced shutdown, aborting running handlers.");
      tasks.abort_all();
      forced = true;
    } else {
      info!(kind = %self.kind, running = tasks.len(), "Waiting for running handlers to finish.");
    }

    loop {
      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed(), if !forced => {
          if self.shutdown_mode() == Some(ShutdownMode::Force) {
            warn!(kind = %self.kind, running = tasks.len(), "Forced shutdown, aborting running handlers.");
            tasks.abort_all();
            forced = true;
          }
        }

        result = tasks.join_next() => match result {
          Some(result) => self.log_task_exit(result),
          None => break,
        }
      }
    }
  }

  fn log_task_exit(&self, result: Result<(), JoinError>) {
    match result {
      Ok(()) => {}
      Err(e) if e.is_cancelled() => {
        debug!(kind = %self.kind, "Handler task aborted; its lease will expire.");
      }
      Err(e) => {
        // Handler panics are caught inside the task; this is a bug in the outcome path.
        error!(kind = %self.kind, error = %e, "Job task panicked outside the handler.");
      }
    }
  }

  async fn claim(&self, limit: usize) -> Vec<(ConnectionHandle, Job)> {
    let handle = match self.connection.handle() {
      Ok(handle) => handle,
      Err(e) => {
        debug!(kind = %self.kind, error = %e, "No store connection, skipping poll.");
        return Vec::new();
      }
    };

    let now = Utc::now();
    let request = ClaimRequest {
      kind: self.kind,
      limit,
      lease: self.settings.lease_duration,
      worker_id: &self.worker_id,
      now,
    };
    match handle.store().claim_jobs(request).await {
      Ok(jobs) => {
        if !jobs.is_empty() {
          debug!(kind = %self.kind, count = jobs.len(), "Claimed jobs.");
        }
        for job in &jobs {
          DispatchMetrics::incr(&self.metrics.jobs_claimed);
          if let Ok(wait) = now.signed_duration_since(job.not_before).to_std() {
            self.metrics.queue_wait_duration.record(wait);
          }
        }
        jobs.into_iter().map(|job| (handle.clone(), job)).collect()
      }
      Err(e) => {
        DispatchMetrics::incr(&self.metrics.store_errors);
        warn!(kind = %self.kind, error = %e, "Failed to claim jobs, backing off.");
        Vec::new()
      }
    }
  }

  fn spawn_job(&self, tasks: &mut JoinSet<()>, handle: ConnectionHandle, job: Job) {
    let span = tracing::span!(
      tracing::Level::INFO,
      "job_exec",
      worker_id = %self.worker_id,
      job_id = %job.id,
      kind = %job.kind(),
      attempt = job.attempts,
    );
    let execution = Execution {
      settings: self.settings.clone(),
      worker_id: self.worker_id.clone(),
      handlers: self.handlers.clone(),
      metrics: self.metrics.clone(),
      _in_flight: InFlight::enter(self.in_flight.clone(), self.metrics.clone()),
      handle,
      job,
    };
    tasks.spawn(execution.execute().instrument(span));
  }
}

/// Counts a running handler for as long as it is alive, including when its
/// task is aborted.
struct InFlight {
  counter: Arc<AtomicUsize>,
  metrics: DispatchMetrics,
}

impl InFlight {
  fn enter(counter: Arc<AtomicUsize>, metrics: DispatchMetrics) -> Self {
    let now = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
    metrics.handlers_active_current.store(now, AtomicOrdering::Relaxed);
    Self { counter, metrics }
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    let prev = self.counter.fetch_sub(1, AtomicOrdering::SeqCst);
    self
      .metrics
      .handlers_active_current
      .store(prev.saturating_sub(1), AtomicOrdering::Relaxed);
  }
}

/// Everything one handler task owns.
struct Execution {
  settings: KindSettings,
  #[cfg_attr(not(feature = "job_context"), allow(dead_code))]
  worker_id: WorkerId,
  handlers: Arc<HandlerTable>,
  metrics: DispatchMetrics,
  _in_flight: InFlight,
  handle: ConnectionHandle,
  job: Job,
}

impl Execution {
  async fn execute(self) {
    let started_at = self.job.started_at.unwrap_or_else(Utc::now);
    let start = Instant::now();
    info!("Starting job execution.");

    let result = self.invoke_handler(started_at).await;
    let duration = start.elapsed();
    self.metrics.handler_duration.record(duration);

    let outcome = match &result {
      Ok(()) => "success",
      Err(HandlerError::Failed(_)) => "failed",
      Err(HandlerError::Panicked(_)) => "panic",
      Err(HandlerError::TimedOut(_)) => "timeout",
    };
    info!(duration_ms = duration.as_millis() as u64, outcome, "Finished job execution.");

    self.record_outcome(result, Utc::now()).await;
  }

  /// Runs the handler, turning panics and timeouts into `HandlerError`s.
  async fn invoke_handler(&self, started_at: DateTime<Utc>) -> Result<(), HandlerError> {
    // The handler is called on first poll, so a panic while building its
    // future is caught below like one raised while awaiting it.
    let future = async { self.handlers.invoke(&self.job, started_at).await };

    #[cfg(feature = "job_context")]
    let future = {
      let context = JobContext {
        job_id: self.job.id,
        kind: self.job.kind(),
        attempt: self.job.attempts,
        started_at,
        worker_id: self.worker_id.clone(),
      };
      CURRENT_JOB_CONTEXT.scope(context, future)
    };

    let guarded = AssertUnwindSafe(future).catch_unwind();
    let result = match self.settings.handler_timeout {
      Some(limit) => match tokio::time::timeout(limit, guarded).await {
        Ok(result) => result,
        Err(_) => {
          DispatchMetrics::incr(&self.metrics.jobs_timed_out);
          warn!(timeout = ?limit, "Handler timed out.");
          return Err(HandlerError::TimedOut(limit));
        }
      },
      None => guarded.await,
    };

    match result {
      Ok(Ok(())) => Ok(()),
      Ok(Err(e)) => {
        DispatchMetrics::incr(&self.metrics.jobs_failed_attempts);
        Err(e)
      }
      Err(panic) => {
        DispatchMetrics::incr(&self.metrics.jobs_panicked);
        let message = panic_message(panic.as_ref());
        error!(panic = %message, "Handler panicked.");
        Err(HandlerError::Panicked(message))
      }
    }
  }

  async fn record_outcome(&self, result: Result<(), HandlerError>, now: DateTime<Utc>) {
    let store = self.handle.store();
    let token = self.job.claim_token();

    let written = match result {
      Ok(()) => {
        let written = store.complete_job(token, now).await;
        if matches!(written, Ok(true)) {
          DispatchMetrics::incr(&self.metrics.jobs_completed);
        }
        written
      }
      Err(e) => {
        let message = e.to_string();
        match decide_on_failure(&self.job.retry, self.job.attempts, now) {
          FailureDecision::Retry { not_before, delay } => {
            info!(
              retry_limit = self.job.retry.limit,
              delay_ms = delay.as_millis() as u64,
              next_run = %not_before,
              error = %message,
              "Job failed, scheduling retry."
            );
            let written = store.retry_job(token, not_before, &message).await;
            if matches!(written, Ok(true)) {
              DispatchMetrics::incr(&self.metrics.jobs_retried);
            }
            written
          }
          FailureDecision::Fail => {
            error!(
              retry_limit = self.job.retry.limit,
              error = %message,
              "Job failed permanently after exhausting retries."
            );
            let written = store.fail_job(token, &message, now).await;
            if matches!(written, Ok(true)) {
              DispatchMetrics::incr(&self.metrics.jobs_permanently_failed);
            }
            written
          }
        }
      }
    };

    match written {
      Ok(true) => {}
      Ok(false) => {
        DispatchMetrics::incr(&self.metrics.stale_outcomes);
        warn!("Claim no longer current (lease expired or job expired); outcome discarded.");
      }
      Err(e) => {
        DispatchMetrics::incr(&self.metrics.store_errors);
        error!(error = %e, "Failed to record job outcome; the lease will recover the job.");
      }
    }
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
