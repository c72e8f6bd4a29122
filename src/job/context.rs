use super::{JobId, JobKind};

use chrono::{DateTime, Utc};

/// Contextual information available to a running handler via task-locals.
/// Accessible inside handler futures using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug)]
pub struct JobContext {
  pub job_id: JobId,
  pub kind: JobKind,
  /// 1-based attempt number of this execution.
  pub attempt: u32,
  pub started_at: DateTime<Utc>,
  /// Identifier of the dispatcher instance running the job.
  pub worker_id: String,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a handler's execution scope.
    /// Set by the dispatcher if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing handler.
///
/// Returns `None` if called outside a dispatcher-managed job.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a
/// dispatcher-managed job.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
