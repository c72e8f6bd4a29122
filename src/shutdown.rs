//! Orderly process shutdown on termination signals.

use crate::connection::ConnectionManager;
use crate::dispatcher::DispatcherHandle;
use crate::error::ShutdownError;
use crate::health::HealthMonitor;
use crate::maintenance::Maintenance;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
  /// SIGTERM
  Terminate,
  /// SIGINT / Ctrl-C
  Interrupt,
  /// SIGHUP
  Hangup,
}

impl fmt::Display for ShutdownSignal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ShutdownSignal::Terminate => "SIGTERM",
      ShutdownSignal::Interrupt => "SIGINT",
      ShutdownSignal::Hangup => "SIGHUP",
    })
  }
}

/// How shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
  /// Every handler finished and the connection closed cleanly.
  Graceful,
  /// The grace period ran out; remaining handlers were aborted.
  TimedOut,
  /// A second signal arrived during shutdown.
  Forced,
  /// A dispatcher task panicked or the connection failed to close.
  Failed,
}

impl ShutdownOutcome {
  /// Process exit code for this outcome.
  pub fn exit_code(&self) -> i32 {
    match self {
      ShutdownOutcome::Graceful => 0,
      _ => 1,
    }
  }
}

/// Stops every component in order: health monitor, maintenance, dispatcher
/// (drained within the grace period), then the connection.
#[derive(Debug)]
pub struct ShutdownCoordinator {
  connection: Arc<ConnectionManager>,
  dispatcher: Option<Arc<DispatcherHandle>>,
  health: Option<Arc<HealthMonitor>>,
  maintenance: Option<Arc<Maintenance>>,
  grace: Duration,
}

impl ShutdownCoordinator {
  pub fn new(connection: Arc<ConnectionManager>, grace: Duration) -> Self {
    Self {
      connection,
      dispatcher: None,
      health: None,
      maintenance: None,
      grace,
    }
  }

  pub fn dispatcher(mut self, dispatcher: Arc<DispatcherHandle>) -> Self {
    self.dispatcher = Some(dispatcher);
    self
  }

  pub fn health(mut self, health: Arc<HealthMonitor>) -> Self {
    self.health = Some(health);
    self
  }

  pub fn maintenance(mut self, maintenance: Arc<Maintenance>) -> Self {
    self.maintenance = Some(maintenance);
    self
  }

  /// Waits for the first signal, then shuts down. A second signal while
  /// shutting down aborts running handlers and returns
  /// [`ShutdownOutcome::Forced`] at once.
  ///
  /// A closed signal channel counts as a shutdown request.
  pub async fn run(&self, mut signals: mpsc::Receiver<ShutdownSignal>) -> ShutdownOutcome {
    wait_for_signal(&mut signals).await;
    self.shutdown_unless_forced(&mut signals).await
  }

  /// Shuts down now, unless another signal arrives on `signals` first, in
  /// which case running handlers are aborted and the outcome is `Forced`.
  pub async fn shutdown_unless_forced(
    &self,
    signals: &mut mpsc::Receiver<ShutdownSignal>,
  ) -> ShutdownOutcome {
    tokio::select! {
      outcome = self.shutdown() => outcome,
      Some(signal) = signals.recv() => {
        warn!(%signal, "Received second signal during shutdown, forcing exit.");
        if let Some(dispatcher) = &self.dispatcher {
          dispatcher.signal_force();
        }
        ShutdownOutcome::Forced
      }
    }
  }

  /// Shuts down without waiting for a signal.
  pub async fn shutdown(&self) -> ShutdownOutcome {
    if let Some(health) = &self.health {
      health.stop().await;
    }
    if let Some(maintenance) = &self.maintenance {
      maintenance.stop().await;
    }

    let mut outcome = match &self.dispatcher {
      None => ShutdownOutcome::Graceful,
      Some(dispatcher) => match dispatcher.drain(self.grace).await {
        Ok(()) | Err(ShutdownError::AlreadyShuttingDown) => ShutdownOutcome::Graceful,
        Err(ShutdownError::Timeout(grace)) => {
          error!(?grace, "Shutdown timed out waiting for running jobs.");
          ShutdownOutcome::TimedOut
        }
        Err(e) => {
          error!(error = %e, "Dispatcher did not stop cleanly.");
          ShutdownOutcome::Failed
        }
      },
    };

    if let Err(e) = self.connection.stop().await {
      error!(error = %e, "Failed to close job store connection during shutdown.");
      if outcome == ShutdownOutcome::Graceful {
        outcome = ShutdownOutcome::Failed;
      }
    }

    info!(?outcome, "Shutdown finished.");
    outcome
  }
}

/// Waits for the first termination signal. Returns when the channel closes.
pub async fn wait_for_signal(signals: &mut mpsc::Receiver<ShutdownSignal>) {
  match signals.recv().await {
    Some(signal) => info!(%signal, "Received shutdown signal, shutting down gracefully."),
    None => info!("Signal source closed, shutting down gracefully."),
  }
}

/// Forwards SIGTERM, SIGINT and SIGHUP (Ctrl-C only on non-Unix targets)
/// into a channel for [`ShutdownCoordinator::run`].
pub fn os_signals() -> std::io::Result<mpsc::Receiver<ShutdownSignal>> {
  let (tx, rx) = mpsc::channel(4);

  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
      loop {
        let received = tokio::select! {
          Some(()) = term.recv() => ShutdownSignal::Terminate,
          Some(()) = int.recv() => ShutdownSignal::Interrupt,
          Some(()) = hup.recv() => ShutdownSignal::Hangup,
          else => break,
        };
        if tx.send(received).await.is_err() {
          break;
        }
      }
    });
  }

  #[cfg(not(unix))]
  tokio::spawn(async move {
    while tokio::signal::ctrl_c().await.is_ok() {
      if tx.send(ShutdownSignal::Interrupt).await.is_err() {
        break;
      }
    }
  });

  Ok(rx)
}
