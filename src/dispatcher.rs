//! Runs one polling loop per job kind and coordinates their shutdown.

use crate::connection::ConnectionManager;
use crate::error::{JobError, ShutdownError};
use crate::handler::HandlerTable;
use crate::job::{JobKind, WorkerId};
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::registry::Registry;
use crate::worker::KindWorker;

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Requested shutdown mode, sent to the kind loops over a `watch` channel.
/// `None` on the channel means running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop claiming and let running handlers finish.
  Graceful,
  /// Stop claiming and abort running handlers. Their jobs stay `active` until
  /// the lease expires.
  Force,
}

/// Configured, not yet running dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
  connection: Arc<ConnectionManager>,
  registry: Arc<Registry>,
  handlers: Arc<HandlerTable>,
  worker_id: WorkerId,
  kinds: Vec<JobKind>,
}

impl Dispatcher {
  pub fn new(
    connection: Arc<ConnectionManager>,
    registry: Arc<Registry>,
    handlers: Arc<HandlerTable>,
  ) -> Self {
    let kinds = registry.kinds().collect();
    Self {
      connection,
      registry,
      handlers,
      worker_id: format!("worker-{}", Uuid::new_v4()),
      kinds,
    }
  }

  /// Identifier recorded on claimed jobs. Defaults to a random one.
  pub fn worker_id(mut self, worker_id: impl Into<WorkerId>) -> Self {
    self.worker_id = worker_id.into();
    self
  }

  /// Restricts dispatching to `kinds`. By default every kind is served.
  pub fn only_kinds(mut self, kinds: impl IntoIterator<Item = JobKind>) -> Self {
    self.kinds = kinds.into_iter().collect();
    self.kinds.sort();
    self.kinds.dedup();
    self
  }

  /// Spawns the kind loops.
  ///
  /// # Errors
  ///
  /// [`JobError::NotInitialized`] if the connection has not been started.
  pub fn start(&self) -> Result<DispatcherHandle, JobError> {
    self.connection.handle()?;

    let metrics = DispatchMetrics::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);

    let mut tasks = Vec::with_capacity(self.kinds.len());
    for &kind in &self.kinds {
      let settings = self.registry.settings(kind).clone();
      if settings.concurrency == 0 {
        warn!(%kind, "Concurrency is 0, kind will not be dispatched.");
        continue;
      }
      let worker = KindWorker::new(
        kind,
        settings,
        self.worker_id.clone(),
        self.connection.clone(),
        self.handlers.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
        in_flight.clone(),
      );
      tasks.push(tokio::spawn(worker.run()));
    }
    info!(worker_id = %self.worker_id, kinds = tasks.len(), "Dispatcher started.");

    Ok(DispatcherHandle {
      worker_id: self.worker_id.clone(),
      shutdown_tx,
      tasks: Mutex::new(Some(tasks)),
      in_flight,
      metrics,
    })
  }
}

/// Controls running kind loops.
#[derive(Debug)]
pub struct DispatcherHandle {
  worker_id: WorkerId,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
  in_flight: Arc<AtomicUsize>,
  metrics: DispatchMetrics,
}

impl DispatcherHandle {
  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  /// Handlers currently running.
  pub fn in_flight(&self) -> usize {
    self.in_flight.load(AtomicOrdering::SeqCst)
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  /// Stops claiming new jobs. Running handlers continue.
  pub fn stop_claiming(&self) {
    self.shutdown_tx.send_if_modified(|mode| {
      if mode.is_none() {
        *mode = Some(ShutdownMode::Graceful);
        true
      } else {
        false
      }
    });
  }

  /// Requests abortion of running handlers without waiting.
  pub fn signal_force(&self) {
    self.shutdown_tx.send_replace(Some(ShutdownMode::Force));
  }

  /// Stops claiming and waits up to `grace` for running handlers.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::Timeout`]: handlers were still running after `grace`;
  ///   they have been aborted and their jobs left untouched.
  /// - [`ShutdownError::AlreadyShuttingDown`]: called a second time.
  /// - [`ShutdownError::TaskPanic`]: a kind loop panicked.
  pub async fn drain(&self, grace: Duration) -> Result<(), ShutdownError> {
    let tasks = self.take_tasks().await?;
    info!(worker_id = %self.worker_id, in_flight = self.in_flight(), ?grace, "Draining dispatcher.");
    self.stop_claiming();

    let mut all = Box::pin(join_all(tasks));
    match tokio::time::timeout(grace, &mut all).await {
      Ok(results) => {
        check_joined(results)?;
        info!(worker_id = %self.worker_id, "Dispatcher drained.");
        Ok(())
      }
      Err(_) => {
        error!(worker_id = %self.worker_id, in_flight = self.in_flight(), ?grace, "Grace period exceeded, aborting running handlers.");
        self.signal_force();
        check_joined(all.await)?;
        Err(ShutdownError::Timeout(grace))
      }
    }
  }

  /// Aborts running handlers and waits for the kind loops to exit.
  pub async fn force(&self) -> Result<(), ShutdownError> {
    let tasks = self.take_tasks().await?;
    warn!(worker_id = %self.worker_id, in_flight = self.in_flight(), "Forcing dispatcher shutdown.");
    self.signal_force();
    check_joined(join_all(tasks).await)
  }

  async fn take_tasks(&self) -> Result<Vec<JoinHandle<()>>, ShutdownError> {
    self
      .tasks
      .lock()
      .await
      .take()
      .ok_or(ShutdownError::AlreadyShuttingDown)
  }
}

fn check_joined(results: Vec<Result<(), tokio::task::JoinError>>) -> Result<(), ShutdownError> {
  let mut result = Ok(());
  for joined in results {
    if let Err(e) = joined {
      error!(error = %e, "Kind worker task panicked.");
      result = Err(ShutdownError::TaskPanic);
    }
  }
  result
}
