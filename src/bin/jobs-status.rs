//! Prints job counts per state, warnings and an overall health verdict for
//! the PostgreSQL job queue.
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/app jobs-status
//! DATABASE_URL=postgres://localhost/app jobs-status --json
//! ```
//!
//! Exits 0 when the report was produced (healthy or not), 1 when the store
//! could not be queried.

use anyhow::{Context, Result};
use clap::Parser;

use jobkeeper::store::PostgresConnector;
use jobkeeper::telemetry::{init_tracing, LogFormat};
use jobkeeper::JobQueue;

#[derive(Parser, Debug)]
#[command(name = "jobs-status")]
#[command(about = "Summarizes the state of the job queue")]
struct Args {
  /// Store connection string.
  #[arg(long, env = "DATABASE_URL")]
  database_url: String,

  /// Application name; the connection is labelled `<APP_NAME>-jobs`.
  #[arg(long, env = "APP_NAME", default_value = "app")]
  app_name: String,

  #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
  log_level: String,

  /// Print the report as JSON instead of text.
  #[arg(long)]
  json: bool,

  /// Exit 2 when the queue is unhealthy.
  #[arg(long)]
  fail_unhealthy: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  init_tracing(&args.log_level, LogFormat::Pretty);

  let connector = PostgresConnector::new(&args.database_url)
    .application_name(format!("{}-jobs", args.app_name))
    .max_connections(1);
  let queue = JobQueue::builder(connector).build();

  queue.start().await.context("failed to connect to the job store")?;
  let report = queue.status().await;
  queue.stop().await.context("failed to close the job store connection")?;
  let report = report.context("failed to query job counts")?;

  if args.json {
    println!("{}", serde_json::to_string_pretty(&report)?);
  } else {
    print!("{report}");
  }

  if args.fail_unhealthy && !report.healthy {
    std::process::exit(2);
  }
  Ok(())
}
