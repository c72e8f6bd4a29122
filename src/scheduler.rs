//! Registration of recurring CRON schedules.
//!
//! The scheduler only records definitions. Jobs are materialized from them by
//! the [`Maintenance`](crate::maintenance::Maintenance) loop, through the
//! store, so any number of processes can share one set of schedules.

use crate::connection::ConnectionManager;
use crate::error::{JobError, ValidationError};
use crate::job::{JobKind, JobPayload};
use crate::schedule::{CronSchedule, RecurringSchedule, ScheduleOutcome};

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Scheduler {
  connection: Arc<ConnectionManager>,
}

impl Scheduler {
  pub fn new(connection: Arc<ConnectionManager>) -> Self {
    Self { connection }
  }

  /// Registers `payload_template` to be published on every tick of
  /// `cron_expression`, evaluated in `timezone` (an IANA name such as
  /// `Europe/Berlin`).
  ///
  /// Schedules are keyed by (kind, expression): registering the same pair
  /// again updates the template and timezone, or is a no-op if nothing changed.
  ///
  /// # Errors
  ///
  /// - [`JobError::Validation`]: bad payload, expression or timezone.
  /// - [`JobError::NotInitialized`]: the connection has not been started.
  /// - [`JobError::Schedule`]: the store write failed.
  pub async fn schedule_recurring(
    &self,
    payload_template: impl Into<JobPayload>,
    cron_expression: &str,
    timezone: &str,
  ) -> Result<ScheduleOutcome, JobError> {
    let payload_template = payload_template.into();
    payload_template.validate()?;
    let cron = CronSchedule::parse(cron_expression, timezone)?;

    let now = Utc::now();
    let next_run_at = cron
      .next_after(now)
      .ok_or_else(|| ValidationError::InvalidCron {
        expression: cron_expression.to_string(),
        reason: "expression has no future occurrences".to_string(),
      })?;

    let kind = payload_template.kind();
    let schedule = RecurringSchedule {
      payload_template,
      cron_expression: cron.expression().to_string(),
      timezone: cron.timezone().name().to_string(),
      next_run_at,
      created_at: now,
      updated_at: now,
    };

    let handle = self.connection.handle()?;
    let outcome = handle
      .store()
      .upsert_schedule(schedule)
      .await
      .map_err(JobError::Schedule)?;
    info!(%kind, cron = cron.expression(), timezone, %next_run_at, ?outcome, "Recurring schedule registered.");
    Ok(outcome)
  }

  /// Removes a schedule. Returns whether it existed.
  pub async fn unschedule(&self, kind: JobKind, cron_expression: &str) -> Result<bool, JobError> {
    let handle = self.connection.handle()?;
    let removed = handle
      .store()
      .remove_schedule(kind, cron_expression)
      .await
      .map_err(JobError::Schedule)?;
    if removed {
      info!(%kind, cron = cron_expression, "Recurring schedule removed.");
    }
    Ok(removed)
  }

  pub async fn list(&self) -> Result<Vec<RecurringSchedule>, JobError> {
    let handle = self.connection.handle()?;
    handle.store().list_schedules().await.map_err(JobError::Schedule)
  }
}
