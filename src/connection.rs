//! Lifecycle of the process-wide store connection.

use crate::error::JobError;
use crate::store::{Connector, JobStore};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Shared handle onto the open store. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
  store: Arc<dyn JobStore>,
  opened_at: DateTime<Utc>,
}

impl ConnectionHandle {
  pub fn store(&self) -> &Arc<dyn JobStore> {
    &self.store
  }

  pub fn opened_at(&self) -> DateTime<Utc> {
    self.opened_at
  }

  /// Whether both handles refer to the same connection.
  pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
    Arc::ptr_eq(&self.store, &other.store)
  }
}

impl fmt::Debug for ConnectionHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionHandle")
      .field("store", &self.store)
      .field("opened_at", &self.opened_at)
      .finish()
  }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
  Started,
  Stopped,
  Error(String),
}

/// Owns the single [`ConnectionHandle`] of the process.
///
/// `start` is serialized: concurrent callers wait for the first one and then
/// observe the handle it created.
#[derive(Debug)]
pub struct ConnectionManager {
  connector: Arc<dyn Connector>,
  lifecycle: Mutex<()>,
  handle: RwLock<Option<ConnectionHandle>>,
  events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
  pub fn new(connector: Arc<dyn Connector>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    Self {
      connector,
      lifecycle: Mutex::new(()),
      handle: RwLock::new(None),
      events,
    }
  }

  /// Opens the store, or returns the already open handle.
  ///
  /// # Errors
  ///
  /// [`JobError::Connection`] if the store cannot be reached. The manager
  /// stays unstarted and a later `start` may succeed.
  pub async fn start(&self) -> Result<ConnectionHandle, JobError> {
    if let Some(handle) = self.handle.read().clone() {
      return Ok(handle);
    }

    let _guard = self.lifecycle.lock().await;
    if let Some(handle) = self.handle.read().clone() {
      debug!("Connection started concurrently, reusing handle.");
      return Ok(handle);
    }

    let store = match self.connector.connect().await {
      Ok(store) => store,
      Err(e) => {
        error!(error = %e, "Failed to connect to job store.");
        self.emit(ConnectionEvent::Error(e.to_string()));
        return Err(JobError::Connection(e));
      }
    };

    let handle = ConnectionHandle {
      store,
      opened_at: Utc::now(),
    };
    *self.handle.write() = Some(handle.clone());
    info!("Job store connection started.");
    self.emit(ConnectionEvent::Started);
    Ok(handle)
  }

  /// Closes the store. Idempotent, and a no-op if never started.
  ///
  /// The handle is released even when closing fails; the failure is then
  /// reported as [`JobError::Connection`].
  pub async fn stop(&self) -> Result<(), JobError> {
    let _guard = self.lifecycle.lock().await;
    let Some(handle) = self.handle.write().take() else {
      debug!("Stop requested but connection is not started.");
      return Ok(());
    };

    match handle.store.close().await {
      Ok(()) => {
        info!("Job store connection stopped.");
        self.emit(ConnectionEvent::Stopped);
        Ok(())
      }
      Err(e) => {
        error!(error = %e, "Error while closing job store connection.");
        self.emit(ConnectionEvent::Error(e.to_string()));
        Err(JobError::Connection(e))
      }
    }
  }

  /// The open handle.
  ///
  /// # Errors
  ///
  /// [`JobError::NotInitialized`] before `start` or after `stop`.
  pub fn handle(&self) -> Result<ConnectionHandle, JobError> {
    self.handle.read().clone().ok_or(JobError::NotInitialized)
  }

  pub fn is_started(&self) -> bool {
    self.handle.read().is_some()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.events.subscribe()
  }

  fn emit(&self, event: ConnectionEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }
}
