//! Worker process: claims jobs from the PostgreSQL queue and runs them until
//! SIGTERM, SIGINT or SIGHUP.
//!
//! # Usage
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/app jobs-worker --kind backup.database --kind report.generate
//! ```
//!
//! Queue settings come from the environment (see `JobsConfig`). Exits 0 after
//! a graceful shutdown and 1 otherwise.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use jobkeeper::shutdown::os_signals;
use jobkeeper::store::PostgresConnector;
use jobkeeper::telemetry::{init_tracing, LogFormat};
use jobkeeper::{HandlerTable, JobKind, JobQueue, JobsConfig};

/// Command line arguments. Anything not given here is read from the environment.
#[derive(Parser, Debug)]
#[command(name = "jobs-worker")]
#[command(about = "Runs background jobs from the PostgreSQL job queue")]
struct Args {
  /// Identifier recorded on claimed jobs. Random when omitted.
  #[arg(long, env = "JOBS_WORKER_ID")]
  worker_id: Option<String>,

  /// Only dispatch this kind (repeatable). Every kind when omitted.
  #[arg(long = "kind", value_name = "KIND")]
  kinds: Vec<JobKind>,

  /// Overrides LOG_FORMAT.
  #[arg(long)]
  log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  let config = JobsConfig::from_env().context("failed to read job queue configuration")?;
  init_tracing(&config.log_level, args.log_format.unwrap_or(config.log_format));

  let connector = PostgresConnector::new(&config.database_url)
    .application_name(&config.application_name)
    .max_connections(config.max_connections);

  let mut builder = JobQueue::builder(connector)
    .config(&config)
    .handlers(HandlerTable::logging());
  if let Some(worker_id) = args.worker_id {
    builder = builder.worker_id(worker_id);
  }
  if !args.kinds.is_empty() {
    builder = builder.only_kinds(args.kinds);
  }
  let queue = builder.build();

  queue.start().await.context("failed to connect to the job store")?;
  let dispatcher = queue.start_worker()?;
  info!(worker_id = dispatcher.worker_id(), "Worker running. Waiting for jobs.");
  drop(dispatcher);

  let signals = os_signals().context("failed to install signal handlers")?;
  let outcome = queue.run_until_signalled(signals).await;
  info!(?outcome, "Worker exiting.");
  std::process::exit(outcome.exit_code());
}
