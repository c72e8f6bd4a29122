//! Typed job handlers.
//!
//! [`HandlerTable`] holds exactly one handler per [`JobKind`](crate::job::JobKind).
//! Each handler receives its kind's payload type, so there is no runtime
//! lookup and no way to register a handler for a payload it cannot decode.

use crate::error::HandlerError;
use crate::job::{
  BackupDatabase, CleanupExpiredSessions, Job, JobId, JobKind, JobPayload, Notification,
  ReportGenerate, WelcomeEmail,
};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;

/// A handler for payloads of type `P`.
pub type HandlerFn<P> = Arc<dyn Fn(JobRun<P>) -> HandlerFuture + Send + Sync>;

/// What a handler gets to see of the job it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun<P> {
  pub id: JobId,
  pub kind: JobKind,
  pub payload: P,
  /// 1-based number of this attempt.
  pub attempts: u32,
  pub started_at: DateTime<Utc>,
}

impl<P> JobRun<P> {
  pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> JobRun<Q> {
    JobRun {
      id: self.id,
      kind: self.kind,
      payload: f(self.payload),
      attempts: self.attempts,
      started_at: self.started_at,
    }
  }
}

fn boxed<P, F, Fut>(f: F) -> HandlerFn<P>
where
  F: Fn(JobRun<P>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
  Arc::new(move |run| Box::pin(f(run)) as HandlerFuture)
}

/// One handler per job kind.
#[derive(Clone)]
pub struct HandlerTable {
  welcome_email: HandlerFn<WelcomeEmail>,
  notification_send: HandlerFn<Notification>,
  cleanup_expired_sessions: HandlerFn<CleanupExpiredSessions>,
  backup_database: HandlerFn<BackupDatabase>,
  report_generate: HandlerFn<ReportGenerate>,
}

impl Default for HandlerTable {
  fn default() -> Self {
    Self::logging()
  }
}

impl HandlerTable {
  /// Handlers that log the job and succeed. Replace them with `on_*`.
  pub fn logging() -> Self {
    Self {
      welcome_email: boxed(|run: JobRun<WelcomeEmail>| async move {
        let p = &run.payload;
        info!(job_id = %run.id, user_id = %p.user_id, email = %p.email, locale = %p.locale, "Sending welcome email.");
        Ok(())
      }),
      notification_send: boxed(|run: JobRun<Notification>| async move {
        let p = &run.payload;
        info!(job_id = %run.id, user_id = %p.user_id, channel = ?p.channel, title = %p.title, "Sending notification.");
        Ok(())
      }),
      cleanup_expired_sessions: boxed(|run: JobRun<CleanupExpiredSessions>| async move {
        let p = &run.payload;
        info!(
          job_id = %run.id,
          batch_size = p.batch_size(),
          older_than_days = p.older_than_days(),
          "Cleaning up expired sessions."
        );
        Ok(())
      }),
      backup_database: boxed(|run: JobRun<BackupDatabase>| async move {
        let p = &run.payload;
        info!(job_id = %run.id, backup_type = ?p.backup_type, retention_days = p.retention_days(), "Backing up database.");
        Ok(())
      }),
      report_generate: boxed(|run: JobRun<ReportGenerate>| async move {
        let p = &run.payload;
        info!(
          job_id = %run.id,
          report_type = %p.report_type,
          user_id = %p.user_id,
          date_from = %p.date_from,
          date_to = %p.date_to,
          format = ?p.format,
          "Generating report."
        );
        Ok(())
      }),
    }
  }

  /// Installs `f` for every kind; it receives the tagged payload.
  pub fn from_fn<F, Fut>(f: F) -> Self
  where
    F: Fn(JobRun<JobPayload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
  {
    let f = Arc::new(f);
    let welcome = f.clone();
    let notify = f.clone();
    let cleanup = f.clone();
    let backup = f.clone();
    let report = f;
    Self {
      welcome_email: boxed(move |run: JobRun<WelcomeEmail>| welcome(run.map(JobPayload::from))),
      notification_send: boxed(move |run: JobRun<Notification>| notify(run.map(JobPayload::from))),
      cleanup_expired_sessions: boxed(move |run: JobRun<CleanupExpiredSessions>| {
        cleanup(run.map(JobPayload::from))
      }),
      backup_database: boxed(move |run: JobRun<BackupDatabase>| backup(run.map(JobPayload::from))),
      report_generate: boxed(move |run: JobRun<ReportGenerate>| report(run.map(JobPayload::from))),
    }
  }

  pub fn on_welcome_email<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(JobRun<WelcomeEmail>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
  {
    self.welcome_email = boxed(f);
    self
  }

  pub fn on_notification<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(JobRun<Notification>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
  {
    self.notification_send = boxed(f);
    self
  }

  pub fn on_cleanup_expired_sessions<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(JobRun<CleanupExpiredSessions>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
  {
    self.cleanup_expired_sessions = boxed(f);
    self
  }

  pub fn on_backup_database<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(JobRun<BackupDatabase>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
  {
    self.backup_database = boxed(f);
    self
  }

  pub fn on_report_generate<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(JobRun<ReportGenerate>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
  {
    self.report_generate = boxed(f);
    self
  }

  /// Starts the handler for `job`. The returned future owns everything it needs.
  pub(crate) fn invoke(&self, job: &Job, started_at: DateTime<Utc>) -> HandlerFuture {
    let run = JobRun {
      id: job.id,
      kind: job.kind(),
      payload: (),
      attempts: job.attempts,
      started_at,
    };
    match job.payload.clone() {
      JobPayload::WelcomeEmail(p) => (self.welcome_email)(run.map(|_| p)),
      JobPayload::NotificationSend(p) => (self.notification_send)(run.map(|_| p)),
      JobPayload::CleanupExpiredSessions(p) => (self.cleanup_expired_sessions)(run.map(|_| p)),
      JobPayload::BackupDatabase(p) => (self.backup_database)(run.map(|_| p)),
      JobPayload::ReportGenerate(p) => (self.report_generate)(run.map(|_| p)),
    }
  }
}

impl fmt::Debug for HandlerTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HandlerTable").finish_non_exhaustive()
  }
}
