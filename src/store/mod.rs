//! Persistence for jobs and recurring schedules.
//!
//! [`JobStore`] is the contract the rest of the crate relies on. The one
//! concurrency guarantee it must provide is claim atomicity: a job handed to
//! one caller of [`JobStore::claim_jobs`] is never handed to another until
//! its lease has expired.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::{StoreError, ValidationError};
use crate::job::{ClaimToken, Job, JobId, JobKind, JobOptions, JobState, NewJob};
use crate::registry::Registry;
use crate::schedule::{RecurringSchedule, ScheduleOutcome};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::{MemoryConnector, MemoryStore};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnector, PostgresStore};

/// Result of inserting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
  Inserted(JobId),
  /// A non-terminal job with the same (kind, singleton key) already exists.
  Existing(JobId),
}

impl InsertOutcome {
  pub fn id(&self) -> JobId {
    match self {
      InsertOutcome::Inserted(id) | InsertOutcome::Existing(id) => *id,
    }
  }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
  Cancelled,
  /// The job is claimed; cancellation does not preempt running handlers.
  Active,
  AlreadyTerminal(JobState),
  NotFound,
}

/// Parameters of one claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
  pub kind: JobKind,
  pub limit: usize,
  pub lease: Duration,
  pub worker_id: &'a str,
  pub now: DateTime<Utc>,
}

/// What a maintenance sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  /// Non-terminal jobs past their deadline, now `expired`.
  pub expired: u64,
  /// Active jobs whose lease ran out with no retries left, now `failed`.
  pub abandoned: u64,
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StateCounts {
  pub created: u64,
  pub active: u64,
  pub retry: u64,
  pub completed: u64,
  pub failed: u64,
  pub cancelled: u64,
  pub expired: u64,
}

impl StateCounts {
  pub fn get(&self, state: JobState) -> u64 {
    match state {
      JobState::Created => self.created,
      JobState::Active => self.active,
      JobState::Retry => self.retry,
      JobState::Completed => self.completed,
      JobState::Failed => self.failed,
      JobState::Cancelled => self.cancelled,
      JobState::Expired => self.expired,
    }
  }

  pub fn add(&mut self, state: JobState, n: u64) {
    let slot = match state {
      JobState::Created => &mut self.created,
      JobState::Active => &mut self.active,
      JobState::Retry => &mut self.retry,
      JobState::Completed => &mut self.completed,
      JobState::Failed => &mut self.failed,
      JobState::Cancelled => &mut self.cancelled,
      JobState::Expired => &mut self.expired,
    };
    *slot += n;
  }

  /// Jobs claimed or waiting to be retried.
  pub fn queue_depth(&self) -> u64 {
    self.active + self.retry
  }
}

/// Durable, transactional persistence for jobs and schedules.
#[async_trait]
pub trait JobStore: Send + Sync + fmt::Debug {
  /// Cheap liveness check.
  async fn ping(&self) -> Result<(), StoreError>;

  /// Inserts `job`, or returns the id of the non-terminal job already
  /// holding its (kind, singleton key). Atomic.
  async fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, StoreError>;

  /// Atomically claims up to `limit` eligible jobs of one kind, ordered by
  /// priority (highest first) then creation order. Eligible: `created` or
  /// `retry` with `not_before <= now`, or `active` with an expired lease and
  /// retries left; in both cases `expires_at > now`. Claimed jobs are
  /// `active` with `attempts` incremented and a lease of `lease`.
  async fn claim_jobs(&self, request: ClaimRequest<'_>) -> Result<Vec<Job>, StoreError>;

  /// `active -> completed`. Returns `false` if the token is stale.
  async fn complete_job(&self, token: ClaimToken, now: DateTime<Utc>) -> Result<bool, StoreError>;

  /// `active -> retry` with a new `not_before`. Returns `false` if the token is stale.
  async fn retry_job(
    &self,
    token: ClaimToken,
    not_before: DateTime<Utc>,
    error: &str,
  ) -> Result<bool, StoreError>;

  /// `active -> failed`. Returns `false` if the token is stale.
  async fn fail_job(&self, token: ClaimToken, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

  /// `created | retry -> cancelled`.
  async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError>;

  async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

  /// Expires overdue jobs and fails abandoned ones.
  async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError>;

  async fn count_by_state(&self) -> Result<StateCounts, StoreError>;

  /// Inserts or updates the schedule keyed by (kind, cron expression).
  async fn upsert_schedule(&self, schedule: RecurringSchedule) -> Result<ScheduleOutcome, StoreError>;

  async fn remove_schedule(&self, kind: JobKind, cron_expression: &str) -> Result<bool, StoreError>;

  async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StoreError>;

  /// Inserts one job for every schedule due at `now`, using the kind's
  /// defaults from `registry`, and advances the schedules past `now`.
  /// Returns the ids of newly inserted jobs.
  async fn materialize_due(
    &self,
    now: DateTime<Utc>,
    registry: &Registry,
  ) -> Result<Vec<JobId>, StoreError>;

  /// Releases the underlying connection. Further calls fail with
  /// [`StoreError::Closed`].
  async fn close(&self) -> Result<(), StoreError>;
}

/// Establishes a store connection for the [`ConnectionManager`](crate::connection::ConnectionManager).
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
  async fn connect(&self) -> Result<Arc<dyn JobStore>, StoreError>;
}

/// Job materialized by `schedule` for the tick due at `tick`.
pub(crate) fn tick_job(
  schedule: &RecurringSchedule,
  tick: DateTime<Utc>,
  registry: &Registry,
  now: DateTime<Utc>,
) -> Result<NewJob, ValidationError> {
  let options = JobOptions::new()
    .start_after(tick.min(now))
    .singleton_key(schedule.tick_singleton_key(tick));
  NewJob::build(
    schedule.payload_template.clone(),
    options,
    registry.defaults(schedule.kind()),
    now,
  )
}
