//! The closed set of job kinds and their payload schemas.
//!
//! Every kind has exactly one payload struct. [`JobPayload`] is the tagged
//! union over them; matching on it is how the rest of the crate dispatches
//! per kind, so adding a kind is a compile error everywhere it must be handled.

use crate::error::ValidationError;

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies a job's payload shape and handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobKind {
  #[serde(rename = "user.welcome-email")]
  WelcomeEmail,
  #[serde(rename = "notification.send")]
  NotificationSend,
  #[serde(rename = "cleanup.expired-sessions")]
  CleanupExpiredSessions,
  #[serde(rename = "backup.database")]
  BackupDatabase,
  #[serde(rename = "report.generate")]
  ReportGenerate,
}

impl JobKind {
  /// All kinds, in registration order.
  pub const ALL: [JobKind; 5] = [
    JobKind::WelcomeEmail,
    JobKind::NotificationSend,
    JobKind::CleanupExpiredSessions,
    JobKind::BackupDatabase,
    JobKind::ReportGenerate,
  ];

  /// The wire name stored in the job store.
  pub const fn as_str(&self) -> &'static str {
    match self {
      JobKind::WelcomeEmail => "user.welcome-email",
      JobKind::NotificationSend => "notification.send",
      JobKind::CleanupExpiredSessions => "cleanup.expired-sessions",
      JobKind::BackupDatabase => "backup.database",
      JobKind::ReportGenerate => "report.generate",
    }
  }
}

impl fmt::Display for JobKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobKind {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    JobKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| ValidationError::UnknownKind(s.to_string()))
  }
}

// --- Payload schemas ---

/// `user.welcome-email`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WelcomeEmail {
  pub user_id: String,
  pub email: String,
  pub locale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
  Email,
  Push,
  Sms,
}

/// `notification.send`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Notification {
  pub user_id: String,
  #[serde(rename = "type")]
  pub channel: NotificationChannel,
  pub title: String,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metadata: Option<Map<String, Value>>,
}

/// `cleanup.expired-sessions`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CleanupExpiredSessions {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub batch_size: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub older_than_days: Option<u32>,
}

impl CleanupExpiredSessions {
  pub const DEFAULT_BATCH_SIZE: u32 = 1000;
  pub const DEFAULT_OLDER_THAN_DAYS: u32 = 30;

  pub fn batch_size(&self) -> u32 {
    self.batch_size.unwrap_or(Self::DEFAULT_BATCH_SIZE)
  }

  pub fn older_than_days(&self) -> u32 {
    self.older_than_days.unwrap_or(Self::DEFAULT_OLDER_THAN_DAYS)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
  Full,
  Incremental,
}

/// `backup.database`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackupDatabase {
  #[serde(rename = "type")]
  pub backup_type: BackupType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retention_days: Option<u32>,
}

impl BackupDatabase {
  pub const DEFAULT_RETENTION_DAYS: u32 = 30;

  pub fn retention_days(&self) -> u32 {
    self.retention_days.unwrap_or(Self::DEFAULT_RETENTION_DAYS)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
  Pdf,
  Excel,
  Csv,
}

/// `report.generate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReportGenerate {
  pub report_type: String,
  pub user_id: String,
  pub date_from: NaiveDate,
  pub date_to: NaiveDate,
  pub format: ReportFormat,
}

// --- Tagged union ---

/// A job payload tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
  WelcomeEmail(WelcomeEmail),
  NotificationSend(Notification),
  CleanupExpiredSessions(CleanupExpiredSessions),
  BackupDatabase(BackupDatabase),
  ReportGenerate(ReportGenerate),
}

impl JobPayload {
  pub fn kind(&self) -> JobKind {
    match self {
      JobPayload::WelcomeEmail(_) => JobKind::WelcomeEmail,
      JobPayload::NotificationSend(_) => JobKind::NotificationSend,
      JobPayload::CleanupExpiredSessions(_) => JobKind::CleanupExpiredSessions,
      JobPayload::BackupDatabase(_) => JobKind::BackupDatabase,
      JobPayload::ReportGenerate(_) => JobKind::ReportGenerate,
    }
  }

  /// Checks the field-level rules the type system cannot express.
  pub fn validate(&self) -> Result<(), ValidationError> {
    let kind = self.kind();
    match self {
      JobPayload::WelcomeEmail(p) => {
        require_non_empty(kind, "userId", &p.user_id)?;
        require_non_empty(kind, "locale", &p.locale)?;
        if !p.email.contains('@') {
          return Err(ValidationError::payload(kind, "email must contain '@'"));
        }
        Ok(())
      }
      JobPayload::NotificationSend(p) => {
        require_non_empty(kind, "userId", &p.user_id)?;
        require_non_empty(kind, "title", &p.title)?;
        require_non_empty(kind, "message", &p.message)
      }
      JobPayload::CleanupExpiredSessions(p) => {
        require_positive(kind, "batchSize", p.batch_size)?;
        require_positive(kind, "olderThanDays", p.older_than_days)
      }
      JobPayload::BackupDatabase(p) => require_positive(kind, "retentionDays", p.retention_days),
      JobPayload::ReportGenerate(p) => {
        require_non_empty(kind, "reportType", &p.report_type)?;
        require_non_empty(kind, "userId", &p.user_id)?;
        if p.date_from > p.date_to {
          return Err(ValidationError::payload(
            kind,
            format!("dateFrom {} is after dateTo {}", p.date_from, p.date_to),
          ));
        }
        Ok(())
      }
    }
  }

  /// Serializes the inner payload (without the kind tag).
  pub fn to_json(&self) -> Result<Value, serde_json::Error> {
    match self {
      JobPayload::WelcomeEmail(p) => serde_json::to_value(p),
      JobPayload::NotificationSend(p) => serde_json::to_value(p),
      JobPayload::CleanupExpiredSessions(p) => serde_json::to_value(p),
      JobPayload::BackupDatabase(p) => serde_json::to_value(p),
      JobPayload::ReportGenerate(p) => serde_json::to_value(p),
    }
  }

  /// Parses untyped data against the schema of `kind`.
  pub fn from_json(kind: JobKind, data: Value) -> Result<Self, ValidationError> {
    let parsed = match kind {
      JobKind::WelcomeEmail => serde_json::from_value(data).map(JobPayload::WelcomeEmail),
      JobKind::NotificationSend => serde_json::from_value(data).map(JobPayload::NotificationSend),
      JobKind::CleanupExpiredSessions => {
        serde_json::from_value(data).map(JobPayload::CleanupExpiredSessions)
      }
      JobKind::BackupDatabase => serde_json::from_value(data).map(JobPayload::BackupDatabase),
      JobKind::ReportGenerate => serde_json::from_value(data).map(JobPayload::ReportGenerate),
    };
    parsed.map_err(|e| ValidationError::payload(kind, e.to_string()))
  }
}

fn require_non_empty(kind: JobKind, field: &str, value: &str) -> Result<(), ValidationError> {
  if value.trim().is_empty() {
    Err(ValidationError::payload(kind, format!("{field} must not be empty")))
  } else {
    Ok(())
  }
}

fn require_positive(kind: JobKind, field: &str, value: Option<u32>) -> Result<(), ValidationError> {
  match value {
    Some(0) => Err(ValidationError::payload(kind, format!("{field} must be greater than zero"))),
    _ => Ok(()),
  }
}

macro_rules! impl_payload_from {
  ($($ty:ty => $variant:ident),* $(,)?) => {
    $(
      impl From<$ty> for JobPayload {
        fn from(payload: $ty) -> Self {
          JobPayload::$variant(payload)
        }
      }
    )*
  };
}

impl_payload_from! {
  WelcomeEmail => WelcomeEmail,
  Notification => NotificationSend,
  CleanupExpiredSessions => CleanupExpiredSessions,
  BackupDatabase => BackupDatabase,
  ReportGenerate => ReportGenerate,
}
