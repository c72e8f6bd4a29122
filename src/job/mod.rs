#[cfg(feature = "job_context")]
pub mod context;
pub mod kind;

pub use kind::{
  BackupDatabase, BackupType, CleanupExpiredSessions, JobKind, JobPayload, Notification,
  NotificationChannel, ReportFormat, ReportGenerate, WelcomeEmail,
};

use crate::error::ValidationError;
use crate::retry::RetryPolicy;

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Public Type Aliases ---

/// Unique identifier of a job, assigned at creation. Uses UUID v4.
pub type JobId = Uuid;

/// Identifier of a dispatcher instance, recorded on the jobs it claims.
pub type WorkerId = String;

// --- Lifecycle ---

/// Lifecycle state of a job.
///
/// ```text
/// created -> active -> completed | retry | failed
/// retry   -> active
/// created | retry | active -> expired    (deadline passed)
/// created | retry          -> cancelled  (external request)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
  Created,
  Active,
  Retry,
  Completed,
  Failed,
  Cancelled,
  Expired,
}

impl JobState {
  pub const ALL: [JobState; 7] = [
    JobState::Created,
    JobState::Active,
    JobState::Retry,
    JobState::Completed,
    JobState::Failed,
    JobState::Cancelled,
    JobState::Expired,
  ];

  pub const fn as_str(&self) -> &'static str {
    match self {
      JobState::Created => "created",
      JobState::Active => "active",
      JobState::Retry => "retry",
      JobState::Completed => "completed",
      JobState::Failed => "failed",
      JobState::Cancelled => "cancelled",
      JobState::Expired => "expired",
    }
  }

  pub const fn is_terminal(&self) -> bool {
    matches!(
      self,
      JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Expired
    )
  }

  /// Whether a job waiting in this state may be claimed.
  pub const fn is_claimable(&self) -> bool {
    matches!(self, JobState::Created | JobState::Retry)
  }

  pub fn can_transition_to(&self, next: JobState) -> bool {
    use JobState::*;
    match (self, next) {
      (Created | Retry, Active) => true,
      // Reclaim after an expired lease.
      (Active, Active) => true,
      (Active, Completed | Retry | Failed) => true,
      (Created | Retry | Active, Expired) => true,
      (Created | Retry, Cancelled) => true,
      _ => false,
    }
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    JobState::ALL
      .into_iter()
      .find(|state| state.as_str() == s)
      .ok_or_else(|| format!("unknown job state `{s}`"))
  }
}

// --- Publish options ---

/// Per-publish overrides. Fields left as `None` fall back to the kind's
/// defaults from the [`Registry`](crate::registry::Registry).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
  pub priority: Option<i32>,
  pub not_before: Option<DateTime<Utc>>,
  pub singleton_key: Option<String>,
  pub retry_limit: Option<u32>,
  pub retry_delay: Option<StdDuration>,
  pub retry_backoff: Option<bool>,
  pub expires_at: Option<DateTime<Utc>>,
  pub expire_in: Option<StdDuration>,
}

impl JobOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn priority(mut self, priority: i32) -> Self {
    self.priority = Some(priority);
    self
  }

  pub fn start_after(mut self, not_before: DateTime<Utc>) -> Self {
    self.not_before = Some(not_before);
    self
  }

  pub fn singleton_key(mut self, key: impl Into<String>) -> Self {
    self.singleton_key = Some(key.into());
    self
  }

  pub fn retry_limit(mut self, limit: u32) -> Self {
    self.retry_limit = Some(limit);
    self
  }

  pub fn retry_delay(mut self, delay: StdDuration) -> Self {
    self.retry_delay = Some(delay);
    self
  }

  pub fn retry_backoff(mut self, enabled: bool) -> Self {
    self.retry_backoff = Some(enabled);
    self
  }

  pub fn expires_at(mut self, deadline: DateTime<Utc>) -> Self {
    self.expires_at = Some(deadline);
    self
  }

  /// Relative deadline, measured from publish time. Ignored when
  /// `expires_at` is also set.
  pub fn expire_in(mut self, ttl: StdDuration) -> Self {
    self.expire_in = Some(ttl);
    self
  }
}

/// Publish defaults for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefaults {
  pub priority: i32,
  pub retry: RetryPolicy,
  pub expire_in: StdDuration,
}

impl Default for JobDefaults {
  fn default() -> Self {
    Self {
      priority: 0,
      retry: RetryPolicy::default(),
      expire_in: StdDuration::from_secs(24 * 60 * 60),
    }
  }
}

/// A validated job ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
  pub id: JobId,
  pub payload: JobPayload,
  pub priority: i32,
  pub singleton_key: Option<String>,
  pub not_before: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub retry: RetryPolicy,
  pub created_at: DateTime<Utc>,
}

impl NewJob {
  /// Merges `options` over `defaults` at time `now`.
  pub fn build(
    payload: JobPayload,
    options: JobOptions,
    defaults: &JobDefaults,
    now: DateTime<Utc>,
  ) -> Result<Self, ValidationError> {
    if let Some(key) = &options.singleton_key {
      if key.trim().is_empty() {
        return Err(ValidationError::InvalidOption(
          "singleton key must not be empty".to_string(),
        ));
      }
    }

    let not_before = options.not_before.unwrap_or(now);
    let expires_at = match (options.expires_at, options.expire_in) {
      (Some(deadline), _) => deadline,
      (None, Some(ttl)) => add_std(now, ttl)?,
      (None, None) => add_std(now, defaults.expire_in)?,
    };
    if expires_at <= not_before {
      return Err(ValidationError::InvalidOption(format!(
        "expires_at ({expires_at}) must be after the start time ({not_before})"
      )));
    }

    let retry = RetryPolicy {
      limit: options.retry_limit.unwrap_or(defaults.retry.limit),
      delay_base: options.retry_delay.unwrap_or(defaults.retry.delay_base),
      backoff: options.retry_backoff.unwrap_or(defaults.retry.backoff),
    };

    Ok(Self {
      id: Uuid::new_v4(),
      payload,
      priority: options.priority.unwrap_or(defaults.priority),
      singleton_key: options.singleton_key,
      not_before,
      expires_at,
      retry,
      created_at: now,
    })
  }

  pub fn kind(&self) -> JobKind {
    self.payload.kind()
  }
}

fn add_std(now: DateTime<Utc>, duration: StdDuration) -> Result<DateTime<Utc>, ValidationError> {
  ChronoDuration::from_std(duration)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .ok_or_else(|| ValidationError::InvalidOption(format!("duration {duration:?} is out of range")))
}

// --- Stored job ---

/// A job as persisted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
  pub id: JobId,
  pub payload: JobPayload,
  pub priority: i32,
  pub singleton_key: Option<String>,
  pub state: JobState,
  pub not_before: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  /// Number of times the job has been claimed.
  pub attempts: u32,
  pub retry: RetryPolicy,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub lease_expires_at: Option<DateTime<Utc>>,
  pub claimed_by: Option<WorkerId>,
  pub last_error: Option<String>,
}

impl Job {
  pub fn kind(&self) -> JobKind {
    self.payload.kind()
  }

  pub(crate) fn from_new(new: NewJob) -> Self {
    Self {
      id: new.id,
      payload: new.payload,
      priority: new.priority,
      singleton_key: new.singleton_key,
      state: JobState::Created,
      not_before: new.not_before,
      expires_at: new.expires_at,
      attempts: 0,
      retry: new.retry,
      created_at: new.created_at,
      started_at: None,
      completed_at: None,
      lease_expires_at: None,
      claimed_by: None,
      last_error: None,
    }
  }

  /// The exclusive right to write this attempt's outcome.
  pub fn claim_token(&self) -> ClaimToken {
    ClaimToken {
      job_id: self.id,
      attempt: self.attempts,
    }
  }
}

/// Identifies one claim of a job. Outcome writes carrying a token from an
/// earlier attempt (the lease expired and someone else reclaimed the job)
/// are ignored by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken {
  pub job_id: JobId,
  pub attempt: u32,
}
