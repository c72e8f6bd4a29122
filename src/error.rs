use crate::job::JobKind;

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("Job store is unreachable: {0}")]
  Unreachable(String),
  #[error("Job store connection has been closed.")]
  Closed,
  #[error("Failed to (de)serialize stored data: {0}")]
  Serialization(String),
  #[error("Job store backend error: {0}")]
  Backend(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
  fn from(err: sqlx::Error) -> Self {
    match err {
      sqlx::Error::Io(e) => StoreError::Unreachable(e.to_string()),
      sqlx::Error::PoolTimedOut => StoreError::Unreachable("connection pool timed out".to_string()),
      sqlx::Error::PoolClosed => StoreError::Closed,
      sqlx::Error::ColumnDecode { index, source } => {
        StoreError::Serialization(format!("column {index}: {source}"))
      }
      sqlx::Error::Decode(e) => StoreError::Serialization(e.to_string()),
      other => StoreError::Backend(other.to_string()),
    }
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(err: serde_json::Error) -> Self {
    StoreError::Serialization(err.to_string())
  }
}

/// Input rejected before anything reaches the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
  #[error("Unknown job kind `{0}`.")]
  UnknownKind(String),
  #[error("Invalid payload for `{kind}`: {reason}")]
  InvalidPayload { kind: JobKind, reason: String },
  #[error("Invalid cron expression `{expression}`: {reason}")]
  InvalidCron { expression: String, reason: String },
  #[error("Unknown timezone `{0}`.")]
  InvalidTimezone(String),
  #[error("Invalid job option: {0}")]
  InvalidOption(String),
}

impl ValidationError {
  pub(crate) fn payload(kind: JobKind, reason: impl Into<String>) -> Self {
    ValidationError::InvalidPayload {
      kind,
      reason: reason.into(),
    }
  }
}

/// Errors returned synchronously to callers of the job subsystem
/// (publish, schedule, cancel, status, connection lifecycle).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
  #[error("Job queue not initialized. Call `start()` first.")]
  NotInitialized,
  #[error("Job queue is shutting down.")]
  ShuttingDown,
  #[error("Job store connection failed: {0}")]
  Connection(#[source] StoreError),
  #[error(transparent)]
  Validation(#[from] ValidationError),
  #[error("Failed to publish job: {0}")]
  Publish(#[source] StoreError),
  #[error("Failed to register recurring schedule: {0}")]
  Schedule(#[source] StoreError),
  #[error("Job store operation failed: {0}")]
  Store(#[source] StoreError),
}

/// Failure of a single handler invocation.
///
/// Never escapes the dispatcher; it is turned into a `retry` or `failed`
/// transition and recorded as the job's `last_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
  #[error("{0}")]
  Failed(String),
  #[error("handler panicked: {0}")]
  Panicked(String),
  #[error("handler exceeded its timeout of {0:?}")]
  TimedOut(Duration),
}

impl HandlerError {
  pub fn failed(msg: impl Into<String>) -> Self {
    HandlerError::Failed(msg.into())
  }
}

/// Errors related to the shutdown process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Timed out after {0:?} waiting for in-flight jobs to finish.")]
  Timeout(Duration),
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
  #[error("A dispatcher task panicked during the shutdown process.")]
  TaskPanic,
}

/// Errors raised while reading configuration from the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("{0} environment variable is required")]
  Missing(&'static str),
  #[error("Invalid value `{value}` for {key}: {reason}")]
  Invalid {
    key: &'static str,
    value: String,
    reason: String,
  },
}
