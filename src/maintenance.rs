//! Periodic store upkeep: expiring overdue jobs, failing abandoned ones and
//! materializing due recurring schedules.

use crate::connection::ConnectionManager;
use crate::error::JobError;
use crate::job::JobId;
use crate::registry::Registry;
use crate::store::SweepReport;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
  pub sweep: SweepReport,
  pub materialized: Vec<JobId>,
}

#[derive(Debug, Clone)]
struct Pass {
  connection: Arc<ConnectionManager>,
  registry: Arc<Registry>,
}

impl Pass {
  async fn run(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, JobError> {
    let handle = self.connection.handle()?;
    let store = handle.store();
    let sweep = store.sweep(now).await.map_err(JobError::Store)?;
    let materialized = store
      .materialize_due(now, &self.registry)
      .await
      .map_err(JobError::Schedule)?;
    Ok(MaintenanceReport { sweep, materialized })
  }
}

/// Runs [`Maintenance::run_once`] on a fixed interval.
#[derive(Debug)]
pub struct Maintenance {
  pass: Pass,
  interval: Duration,
  running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Maintenance {
  pub fn new(connection: Arc<ConnectionManager>, registry: Arc<Registry>, interval: Duration) -> Self {
    Self {
      pass: Pass {
        connection,
        registry,
      },
      interval,
      running: Mutex::new(None),
    }
  }

  /// One pass at time `now`.
  pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, JobError> {
    self.pass.run(now).await
  }

  /// Starts the periodic task. No-op if already running.
  pub fn start(&self) {
    let mut running = self.running.lock();
    if running.is_some() {
      return;
    }
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let pass = self.pass.clone();
    let period = self.interval;

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          biased;
          _ = stop_rx.changed() => break,
          _ = ticker.tick() => {}
        }
        match pass.run(Utc::now()).await {
          Ok(report) => {
            let MaintenanceReport { sweep, materialized } = &report;
            if sweep.expired > 0 || sweep.abandoned > 0 || !materialized.is_empty() {
              info!(
                expired = sweep.expired,
                abandoned = sweep.abandoned,
                materialized = materialized.len(),
                "Maintenance pass changed jobs."
              );
            } else {
              debug!("Maintenance pass found nothing to do.");
            }
          }
          Err(JobError::NotInitialized) => debug!("Maintenance skipped, connection not started."),
          Err(e) => warn!(error = %e, "Maintenance pass failed."),
        }
      }
      debug!("Maintenance task stopped.");
    });
    *running = Some((stop_tx, task));
    info!(interval = ?self.interval, "Maintenance started.");
  }

  /// Stops the periodic task and waits for a pass in progress to finish.
  pub async fn stop(&self) {
    let Some((stop_tx, task)) = self.running.lock().take() else {
      return;
    };
    let _ = stop_tx.send(true);
    if let Err(e) = task.await {
      warn!(error = %e, "Maintenance task ended abnormally.");
    }
    info!("Maintenance stopped.");
  }
}
