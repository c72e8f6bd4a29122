//! Per-kind publish defaults and dispatch settings.
//!
//! The payload schema of each kind is fixed by [`JobPayload`](crate::job::JobPayload);
//! the registry holds what can be tuned at runtime.

use crate::job::{JobDefaults, JobKind};

use std::collections::BTreeMap;
use std::time::Duration;

/// How the dispatcher polls and runs one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSettings {
  /// Maximum jobs claimed per poll.
  pub batch_size: usize,
  /// Idle wait between polls.
  pub poll_interval: Duration,
  /// Maximum handlers of this kind running at once in this process.
  pub concurrency: usize,
  /// How long a claim stays exclusive before the store may hand the job to
  /// another worker.
  pub lease_duration: Duration,
  /// Abort handlers running longer than this. `None` leaves timeouts to the handler.
  pub handler_timeout: Option<Duration>,
}

impl Default for KindSettings {
  fn default() -> Self {
    Self {
      batch_size: 5,
      poll_interval: Duration::from_secs(2),
      concurrency: 5,
      lease_duration: Duration::from_secs(15 * 60),
      handler_timeout: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSpec {
  pub defaults: JobDefaults,
  pub settings: KindSettings,
}

/// Registry of job kinds. Every [`JobKind`] is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
  kinds: BTreeMap<JobKind, KindSpec>,
}

impl Default for Registry {
  fn default() -> Self {
    Self::uniform(JobDefaults::default(), KindSettings::default())
  }
}

impl Registry {
  /// Same defaults and settings for every kind.
  pub fn uniform(defaults: JobDefaults, settings: KindSettings) -> Self {
    let kinds = JobKind::ALL
      .into_iter()
      .map(|kind| {
        (
          kind,
          KindSpec {
            defaults: defaults.clone(),
            settings: settings.clone(),
          },
        )
      })
      .collect();
    Self { kinds }
  }

  pub fn with_defaults(mut self, kind: JobKind, defaults: JobDefaults) -> Self {
    self.spec_mut(kind).defaults = defaults;
    self
  }

  pub fn with_settings(mut self, kind: JobKind, settings: KindSettings) -> Self {
    self.spec_mut(kind).settings = settings;
    self
  }

  /// Applies `f` to the settings of every kind.
  pub fn map_settings(mut self, f: impl Fn(&mut KindSettings)) -> Self {
    self.kinds.values_mut().for_each(|spec| f(&mut spec.settings));
    self
  }

  pub fn defaults(&self, kind: JobKind) -> &JobDefaults {
    &self.spec(kind).defaults
  }

  pub fn settings(&self, kind: JobKind) -> &KindSettings {
    &self.spec(kind).settings
  }

  pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
    self.kinds.keys().copied()
  }

  fn spec(&self, kind: JobKind) -> &KindSpec {
    // Populated for every kind at construction and never removed.
    &self.kinds[&kind]
  }

  fn spec_mut(&mut self, kind: JobKind) -> &mut KindSpec {
    self.kinds.entry(kind).or_insert_with(|| KindSpec {
      defaults: JobDefaults::default(),
      settings: KindSettings::default(),
    })
  }
}
