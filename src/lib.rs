//! JobKeeper: a durable background-job queue for Tokio
//!
//! Applications publish typed jobs to a persistent store; worker processes
//! claim them, run a handler per job kind, and record the outcome. Recurring
//! jobs are declared as CRON schedules and materialized by the store, so any
//! number of processes can share one queue.
//!
//! # Features
//!
//! - A closed set of job kinds ([`JobKind`]) with typed, validated payloads
//!   ([`JobPayload`]), published with [`JobQueue::publish`] or, for untyped
//!   input, [`JobQueue::publish_json`].
//! - Per-publish options ([`JobOptions`]): priority, delayed start, singleton
//!   keys, retry limit/delay/backoff and expiry.
//! - Recurring schedules from 5-field crontab or 6/7-field CRON expressions,
//!   evaluated in any IANA timezone.
//! - Leased claims: a crashed worker's jobs become claimable again once the
//!   lease runs out. Outcome writes are fenced by the attempt number.
//! - Retries with exponential backoff, capped at [`retry::MAX_RETRY_DELAY`].
//! - Per-kind dispatch settings: batch size, poll interval, concurrency, lease
//!   duration and an optional handler timeout. Handler panics count as failures.
//! - Periodic health checks ([`HealthReport`]) and a status summary with alert
//!   thresholds ([`StatusReport`]).
//! - Graceful shutdown on SIGTERM/SIGINT/SIGHUP with a grace period; a second
//!   signal forces exit.
//! - Stores: [`store::MemoryStore`] (tests, embedded use) and, with the
//!   `postgres` feature, `store::PostgresStore`.
//! - Optional task-local job context (`JobContext`) for handlers (requires the
//!   `job_context` feature, on by default).
//!
//! # Usage
//!
//! ```no_run
//! use jobkeeper::{
//!     handler_fn, HandlerError, HandlerTable, JobOptions, JobQueue,
//!     job::CleanupExpiredSessions,
//!     store::{MemoryConnector, MemoryStore},
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handlers = HandlerTable::logging().on_cleanup_expired_sessions(handler_fn! {
//!         |run| {
//!             println!("cleaning {} sessions per batch", run.payload.batch_size());
//!             Ok::<(), HandlerError>(())
//!         }
//!     });
//!
//!     let queue = JobQueue::builder(MemoryConnector::new(MemoryStore::new()))
//!         .handlers(handlers)
//!         .shutdown_grace(Duration::from_secs(10))
//!         .build();
//!
//!     queue.start().await?;
//!     queue.start_worker()?;
//!
//!     let id = queue
//!         .publish(
//!             CleanupExpiredSessions { batch_size: Some(500), older_than_days: None },
//!             JobOptions::new().priority(1),
//!         )
//!         .await?;
//!     println!("published {id}");
//!
//!     queue
//!         .schedule_recurring(CleanupExpiredSessions::default(), "0 2 * * *", "UTC")
//!         .await?;
//!
//!     let outcome = queue.run_until_signalled(jobkeeper::shutdown::os_signals()?).await;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```
//!
//! # Job Lifecycle
//!
//! ```text
//! created -> active -> completed | retry | failed
//! retry   -> active
//! created | retry | active -> expired
//! created | retry          -> cancelled
//! ```
//!
//! A job with `retry_limit = n` is attempted at most `n + 1` times.
//!
//! # Observability
//!
//! - Every component logs through `tracing` with `job_id`, `kind`, `attempt`
//!   and `worker_id` fields; handlers run inside a `job_exec` span.
//! - [`DispatcherHandle::metrics`] returns a [`MetricsSnapshot`].
//! - [`telemetry::init_tracing`] installs a `tracing-subscriber` for binaries.

// --- Feature-gated Documentation ---

#[cfg(all(doc, feature = "job_context"))]
pub mod job_context_docs {
    //! # Accessing Job Context (`job_context` feature)
    //!
    //! Inside a handler, information about the running attempt is available
    //! through Tokio's task-local context:
    //!
    //! 1.  **`try_get_current_job_context() -> Option<JobContext>`**: returns
    //!     `None` outside a dispatcher-managed job.
    //! 2.  **`job_context!() -> JobContext`**: **panics** outside a
    //!     dispatcher-managed job.
    //!
    //! ```no_run
    //! # #[cfg(feature = "job_context")] {
    //! use jobkeeper::{handler_fn, try_get_current_job_context, HandlerError, HandlerTable};
    //!
    //! let handlers = HandlerTable::logging().on_backup_database(handler_fn! {
    //!     |run| {
    //!         if let Some(ctx) = try_get_current_job_context() {
    //!             println!("attempt {} of job {} on {}", ctx.attempt, ctx.job_id, ctx.worker_id);
    //!         }
    //!         Ok::<(), HandlerError>(())
    //!     }
    //! });
    //! # }
    //! ```
}

// Declare modules within the crate
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod health;
pub mod job;
mod macros;
pub mod maintenance;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod telemetry;
mod worker;

// --- Public Re-exports ---

// Facade
pub use queue::{JobQueue, JobQueueBuilder};

// Components
pub use config::JobsConfig;
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager};
pub use dispatcher::{Dispatcher, DispatcherHandle, ShutdownMode};
pub use handler::{HandlerFuture, HandlerTable, JobRun};
pub use health::{HealthMonitor, HealthReport, QueueDepth};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use publisher::Publisher;
pub use registry::{KindSettings, Registry};
pub use scheduler::Scheduler;
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownSignal};
pub use status::StatusReport;
pub use store::{CancelOutcome, JobStore, StateCounts};

// Error types
pub use error::{ConfigError, HandlerError, JobError, ShutdownError, StoreError, ValidationError};

// Job related types
pub use job::{Job, JobDefaults, JobId, JobKind, JobOptions, JobPayload, JobState};
pub use retry::RetryPolicy;
pub use schedule::{RecurringSchedule, ScheduleOutcome};

// Conditionally export context items
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

// Metrics related types
pub use metrics::MetricsSnapshot;
