//! One-off job publication, cancellation and lookup.

use crate::connection::ConnectionManager;
use crate::error::JobError;
use crate::job::{Job, JobId, JobKind, JobOptions, JobPayload, NewJob};
use crate::registry::Registry;
use crate::store::{CancelOutcome, InsertOutcome};

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

/// Validates jobs and hands them to the store.
#[derive(Debug, Clone)]
pub struct Publisher {
  connection: Arc<ConnectionManager>,
  registry: Arc<Registry>,
}

impl Publisher {
  pub fn new(connection: Arc<ConnectionManager>, registry: Arc<Registry>) -> Self {
    Self {
      connection,
      registry,
    }
  }

  /// Publishes a job whose kind is given by the payload variant.
  ///
  /// With a singleton key, publishing while a non-terminal job of the same
  /// kind holds that key returns the existing job's id and stores nothing.
  ///
  /// # Errors
  ///
  /// - [`JobError::Validation`]: payload or options rejected; nothing stored.
  /// - [`JobError::NotInitialized`]: the connection has not been started.
  /// - [`JobError::Publish`]: the store write failed; nothing stored.
  pub async fn publish(
    &self,
    payload: impl Into<JobPayload>,
    options: JobOptions,
  ) -> Result<JobId, JobError> {
    let payload = payload.into();
    payload.validate()?;
    let kind = payload.kind();
    let job = NewJob::build(payload, options, self.registry.defaults(kind), Utc::now())?;
    let handle = self.connection.handle()?;

    match handle.store().insert_job(job).await.map_err(JobError::Publish)? {
      InsertOutcome::Inserted(id) => {
        info!(job_id = %id, %kind, "Job published.");
        Ok(id)
      }
      InsertOutcome::Existing(id) => {
        debug!(job_id = %id, %kind, "Singleton key already held, returning existing job.");
        Ok(id)
      }
    }
  }

  /// Publishes untyped data, checking it against the schema of `kind`.
  pub async fn publish_json(
    &self,
    kind: &str,
    data: Value,
    options: JobOptions,
  ) -> Result<JobId, JobError> {
    let kind: JobKind = kind.parse()?;
    let payload = JobPayload::from_json(kind, data)?;
    self.publish(payload, options).await
  }

  /// Cancels a job that has not been claimed yet.
  pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, JobError> {
    let handle = self.connection.handle()?;
    let outcome = handle
      .store()
      .cancel_job(id, Utc::now())
      .await
      .map_err(JobError::Store)?;
    info!(job_id = %id, ?outcome, "Cancellation processed.");
    Ok(outcome)
  }

  /// Current record of a job, `None` if unknown.
  pub async fn job_status(&self, id: JobId) -> Result<Option<Job>, JobError> {
    let handle = self.connection.handle()?;
    handle.store().get_job(id).await.map_err(JobError::Store)
  }
}
