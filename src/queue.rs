use crate::config::JobsConfig;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager};
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::JobError;
use crate::handler::HandlerTable;
use crate::health::{HealthMonitor, HealthReport};
use crate::job::{Job, JobId, JobKind, JobOptions, JobPayload, WorkerId};
use crate::maintenance::{Maintenance, MaintenanceReport};
use crate::publisher::Publisher;
use crate::registry::Registry;
use crate::schedule::{RecurringSchedule, ScheduleOutcome};
use crate::scheduler::Scheduler;
use crate::shutdown::{self, ShutdownCoordinator, ShutdownOutcome, ShutdownSignal};
use crate::status::StatusReport;
use crate::store::{CancelOutcome, Connector};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Builder for a [`JobQueue`].
///
/// # Example
///
/// ```no_run
/// use jobkeeper::{JobQueue, HandlerTable, store::{MemoryConnector, MemoryStore}};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), jobkeeper::JobError> {
/// let queue = JobQueue::builder(MemoryConnector::new(MemoryStore::new()))
///     .handlers(HandlerTable::logging())
///     .shutdown_grace(Duration::from_secs(10))
///     .build();
/// queue.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct JobQueueBuilder {
  connector: Arc<dyn Connector>,
  registry: Registry,
  handlers: HandlerTable,
  worker_id: Option<WorkerId>,
  kinds: Option<Vec<JobKind>>,
  health_interval: Duration,
  max_queue_depth: Option<u64>,
  maintenance_interval: Duration,
  shutdown_grace: Duration,
}

impl JobQueueBuilder {
  pub fn new(connector: impl Connector + 'static) -> Self {
    Self {
      connector: Arc::new(connector),
      registry: Registry::default(),
      handlers: HandlerTable::logging(),
      worker_id: None,
      kinds: None,
      health_interval: DEFAULT_HEALTH_INTERVAL,
      max_queue_depth: None,
      maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
      shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
    }
  }

  /// Takes the registry, intervals and grace period from `config`.
  pub fn config(mut self, config: &JobsConfig) -> Self {
    self.registry = config.registry();
    self.health_interval = config.health_interval;
    self.maintenance_interval = config.maintenance_interval;
    self.shutdown_grace = config.shutdown_grace;
    self
  }

  pub fn registry(mut self, registry: Registry) -> Self {
    self.registry = registry;
    self
  }

  pub fn handlers(mut self, handlers: HandlerTable) -> Self {
    self.handlers = handlers;
    self
  }

  pub fn worker_id(mut self, worker_id: impl Into<WorkerId>) -> Self {
    self.worker_id = Some(worker_id.into());
    self
  }

  /// Dispatch only these kinds in this process. Publishing is unaffected.
  pub fn only_kinds(mut self, kinds: impl IntoIterator<Item = JobKind>) -> Self {
    self.kinds = Some(kinds.into_iter().collect());
    self
  }

  pub fn health_interval(mut self, interval: Duration) -> Self {
    self.health_interval = interval;
    self
  }

  pub fn max_queue_depth(mut self, max: u64) -> Self {
    self.max_queue_depth = Some(max);
    self
  }

  pub fn maintenance_interval(mut self, interval: Duration) -> Self {
    self.maintenance_interval = interval;
    self
  }

  pub fn shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = grace;
    self
  }

  pub fn build(self) -> JobQueue {
    let connection = Arc::new(ConnectionManager::new(self.connector));
    let registry = Arc::new(self.registry);

    let mut dispatcher = Dispatcher::new(connection.clone(), registry.clone(), Arc::new(self.handlers));
    if let Some(worker_id) = self.worker_id {
      dispatcher = dispatcher.worker_id(worker_id);
    }
    if let Some(kinds) = self.kinds {
      dispatcher = dispatcher.only_kinds(kinds);
    }
    let mut health = HealthMonitor::new(connection.clone(), self.health_interval);
    if let Some(max) = self.max_queue_depth {
      health = health.max_queue_depth(max);
    }

    JobQueue {
      publisher: Publisher::new(connection.clone(), registry.clone()),
      scheduler: Scheduler::new(connection.clone()),
      maintenance: Arc::new(Maintenance::new(
        connection.clone(),
        registry.clone(),
        self.maintenance_interval,
      )),
      health: Arc::new(health),
      dispatcher,
      running: Mutex::new(Worker::Idle),
      shutdown_grace: self.shutdown_grace,
      registry,
      connection,
    }
  }
}

/// Worker lifecycle of a [`JobQueue`].
#[derive(Debug)]
enum Worker {
  Idle,
  Running(Arc<DispatcherHandle>),
  ShuttingDown,
}

/// The job subsystem of one process: connection, publisher, scheduler,
/// dispatcher, maintenance, health monitor and shutdown, wired together.
#[derive(Debug)]
pub struct JobQueue {
  connection: Arc<ConnectionManager>,
  registry: Arc<Registry>,
  publisher: Publisher,
  scheduler: Scheduler,
  dispatcher: Dispatcher,
  health: Arc<HealthMonitor>,
  maintenance: Arc<Maintenance>,
  running: Mutex<Worker>,
  shutdown_grace: Duration,
}

impl JobQueue {
  pub fn builder(connector: impl Connector + 'static) -> JobQueueBuilder {
    JobQueueBuilder::new(connector)
  }

  // --- Connection ---

  /// Opens the store connection. Idempotent.
  pub async fn start(&self) -> Result<ConnectionHandle, JobError> {
    self.connection.start().await
  }

  /// Closes the store connection. Does not stop the worker; use
  /// [`shutdown`](Self::shutdown) for that.
  pub async fn stop(&self) -> Result<(), JobError> {
    self.connection.stop().await
  }

  pub fn is_started(&self) -> bool {
    self.connection.is_started()
  }

  pub fn connection(&self) -> &Arc<ConnectionManager> {
    &self.connection
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.connection.subscribe()
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  // --- Publishing ---

  pub async fn publish(
    &self,
    payload: impl Into<JobPayload>,
    options: JobOptions,
  ) -> Result<JobId, JobError> {
    self.publisher.publish(payload, options).await
  }

  pub async fn publish_json(
    &self,
    kind: &str,
    data: Value,
    options: JobOptions,
  ) -> Result<JobId, JobError> {
    self.publisher.publish_json(kind, data, options).await
  }

  pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, JobError> {
    self.publisher.cancel(id).await
  }

  pub async fn job_status(&self, id: JobId) -> Result<Option<Job>, JobError> {
    self.publisher.job_status(id).await
  }

  // --- Schedules ---

  pub async fn schedule_recurring(
    &self,
    payload_template: impl Into<JobPayload>,
    cron_expression: &str,
    timezone: &str,
  ) -> Result<ScheduleOutcome, JobError> {
    self
      .scheduler
      .schedule_recurring(payload_template, cron_expression, timezone)
      .await
  }

  pub async fn unschedule(&self, kind: JobKind, cron_expression: &str) -> Result<bool, JobError> {
    self.scheduler.unschedule(kind, cron_expression).await
  }

  pub async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, JobError> {
    self.scheduler.list().await
  }

  // --- Worker ---

  /// Starts dispatching, maintenance and health checks. Returns the running
  /// dispatcher if already started.
  ///
  /// # Errors
  ///
  /// - [`JobError::NotInitialized`] if [`start`](Self::start) has not been called.
  /// - [`JobError::ShuttingDown`] while a shutdown is in progress.
  pub fn start_worker(&self) -> Result<Arc<DispatcherHandle>, JobError> {
    let mut running = self.running.lock();
    match &*running {
      Worker::Running(handle) => return Ok(handle.clone()),
      Worker::ShuttingDown => return Err(JobError::ShuttingDown),
      Worker::Idle => {}
    }
    let handle = Arc::new(self.dispatcher.start()?);
    self.maintenance.start();
    self.health.start();
    info!(worker_id = handle.worker_id(), "Worker started.");
    *running = Worker::Running(handle.clone());
    Ok(handle)
  }

  pub fn dispatcher(&self) -> Option<Arc<DispatcherHandle>> {
    match &*self.running.lock() {
      Worker::Running(handle) => Some(handle.clone()),
      _ => None,
    }
  }

  /// One maintenance pass at `now`, outside the periodic task.
  pub async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, JobError> {
    self.maintenance.run_once(now).await
  }

  // --- Health & status ---

  pub async fn check_health(&self) -> HealthReport {
    self.health.check().await
  }

  pub fn latest_health(&self) -> Option<HealthReport> {
    self.health.latest()
  }

  pub async fn status(&self) -> Result<StatusReport, JobError> {
    let handle = self.connection.handle()?;
    let counts = handle.store().count_by_state().await.map_err(JobError::Store)?;
    Ok(StatusReport::from_counts(counts, Utc::now()))
  }

  // --- Shutdown ---

  /// Hands the running dispatcher to a coordinator. `start_worker` is
  /// refused until [`end_shutdown`](Self::end_shutdown).
  fn begin_shutdown(&self) -> ShutdownCoordinator {
    let mut coordinator = ShutdownCoordinator::new(self.connection.clone(), self.shutdown_grace)
      .health(self.health.clone())
      .maintenance(self.maintenance.clone());
    let mut running = self.running.lock();
    if let Worker::Running(dispatcher) = std::mem::replace(&mut *running, Worker::ShuttingDown) {
      coordinator = coordinator.dispatcher(dispatcher);
    }
    coordinator
  }

  fn end_shutdown(&self) {
    *self.running.lock() = Worker::Idle;
  }

  /// Shuts everything down now.
  pub async fn shutdown(&self) -> ShutdownOutcome {
    let outcome = self.begin_shutdown().shutdown().await;
    self.end_shutdown();
    outcome
  }

  /// Waits for a signal on `signals`, then shuts down. A second signal forces
  /// exit. See [`ShutdownCoordinator::run`].
  ///
  /// The worker keeps running, and stays reachable through
  /// [`dispatcher`](Self::dispatcher), until the first signal arrives.
  pub async fn run_until_signalled(
    &self,
    mut signals: mpsc::Receiver<ShutdownSignal>,
  ) -> ShutdownOutcome {
    shutdown::wait_for_signal(&mut signals).await;
    let outcome = self
      .begin_shutdown()
      .shutdown_unless_forced(&mut signals)
      .await;
    self.end_shutdown();
    outcome
  }
}
