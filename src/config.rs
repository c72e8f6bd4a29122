//! Environment-style configuration.

use crate::error::ConfigError;
use crate::job::JobDefaults;
use crate::registry::{KindSettings, Registry};
use crate::retry::RetryPolicy;
use crate::telemetry::LogFormat;

use std::str::FromStr;
use std::time::Duration;

/// Configuration for a process using the job subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
  /// Store connection string (`DATABASE_URL`).
  pub database_url: String,
  /// Label reported to the store, `<APP_NAME>-jobs`.
  pub application_name: String,
  pub max_connections: u32,
  /// Publish defaults applied to every kind.
  pub defaults: JobDefaults,
  /// Dispatch settings applied to every kind.
  pub dispatch: KindSettings,
  pub health_interval: Duration,
  pub maintenance_interval: Duration,
  pub shutdown_grace: Duration,
  pub log_level: String,
  pub log_format: LogFormat,
}

impl JobsConfig {
  /// Reads the configuration from the process environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Reads the configuration through `lookup`, which returns the value of a
  /// variable if it is set.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let database_url = lookup("DATABASE_URL")
      .filter(|v| !v.trim().is_empty())
      .ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let app_name = lookup("APP_NAME").unwrap_or_else(|| "app".to_string());

    let retry = RetryPolicy {
      limit: parse_or(&lookup, "JOBS_RETRY_LIMIT", 3)?,
      delay_base: Duration::from_secs(parse_or(&lookup, "JOBS_RETRY_DELAY_SECS", 60)?),
      backoff: parse_or(&lookup, "JOBS_RETRY_BACKOFF", true)?,
    };
    let expire_hours: u64 = positive(&lookup, "JOBS_EXPIRE_IN_HOURS", 24)?;
    let expire_in = expire_hours
      .checked_mul(60 * 60)
      .map(Duration::from_secs)
      .ok_or_else(|| ConfigError::Invalid {
        key: "JOBS_EXPIRE_IN_HOURS",
        value: expire_hours.to_string(),
        reason: "too large".to_string(),
      })?;

    let dispatch = KindSettings {
      batch_size: positive(&lookup, "JOBS_BATCH_SIZE", 5)?,
      poll_interval: Duration::from_millis(positive(&lookup, "JOBS_POLL_INTERVAL_MS", 2000)?),
      concurrency: positive(&lookup, "JOBS_CONCURRENCY", 5)?,
      lease_duration: Duration::from_secs(positive(&lookup, "JOBS_LEASE_SECS", 900)?),
      handler_timeout: None,
    };

    Ok(Self {
      database_url,
      application_name: format!("{app_name}-jobs"),
      max_connections: positive(&lookup, "JOBS_MAX_CONNECTIONS", 10)?,
      defaults: JobDefaults {
        priority: 0,
        retry,
        expire_in,
      },
      dispatch,
      health_interval: Duration::from_secs(positive(&lookup, "JOBS_HEALTH_INTERVAL_SECS", 300)?),
      maintenance_interval: Duration::from_secs(positive(
        &lookup,
        "JOBS_MAINTENANCE_INTERVAL_SECS",
        30,
      )?),
      shutdown_grace: Duration::from_secs(parse_or(&lookup, "JOBS_SHUTDOWN_GRACE_SECS", 30)?),
      log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
      log_format: parse_or(&lookup, "LOG_FORMAT", LogFormat::Pretty)?,
    })
  }

  /// Registry carrying this configuration's defaults and dispatch settings for every kind.
  pub fn registry(&self) -> Registry {
    Registry::uniform(self.defaults.clone(), self.dispatch.clone())
  }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match lookup(key) {
    None => Ok(default),
    Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
      key,
      value: raw,
      reason: e.to_string(),
    }),
  }
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr + PartialOrd + Default + Copy,
  T::Err: std::fmt::Display,
{
  let value = parse_or(lookup, key, default)?;
  if value <= T::default() {
    return Err(ConfigError::Invalid {
      key,
      value: lookup(key).unwrap_or_default(),
      reason: "must be greater than zero".to_string(),
    });
  }
  Ok(value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn database_url_is_required() {
    assert_eq!(
      JobsConfig::from_lookup(lookup(&[])).unwrap_err(),
      ConfigError::Missing("DATABASE_URL")
    );
  }

  #[test]
  fn defaults_match_documented_values() {
    let config = JobsConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/app")])).unwrap();
    assert_eq!(config.application_name, "app-jobs");
    assert_eq!(config.max_connections, 10);
    assert_eq!(config.defaults.retry, RetryPolicy::default());
    assert_eq!(config.defaults.expire_in, Duration::from_secs(86_400));
    assert_eq!(config.log_level, "info");
    assert_eq!(config.log_format, LogFormat::Pretty);
  }

  #[test]
  fn overrides_are_parsed() {
    let config = JobsConfig::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/app"),
      ("APP_NAME", "billing"),
      ("JOBS_RETRY_LIMIT", "5"),
      ("JOBS_RETRY_BACKOFF", "false"),
      ("JOBS_CONCURRENCY", "2"),
      ("LOG_FORMAT", "json"),
    ]))
    .unwrap();
    assert_eq!(config.application_name, "billing-jobs");
    assert_eq!(config.defaults.retry.limit, 5);
    assert!(!config.defaults.retry.backoff);
    assert_eq!(config.dispatch.concurrency, 2);
    assert_eq!(config.log_format, LogFormat::Json);
  }

  #[test]
  fn invalid_values_are_reported_with_their_key() {
    let err = JobsConfig::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/app"),
      ("JOBS_MAX_CONNECTIONS", "0"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "JOBS_MAX_CONNECTIONS", .. }));

    let err = JobsConfig::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/app"),
      ("JOBS_RETRY_LIMIT", "many"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "JOBS_RETRY_LIMIT", .. }));
  }

  #[test]
  fn zero_intervals_are_rejected() {
    for key in [
      "JOBS_POLL_INTERVAL_MS",
      "JOBS_LEASE_SECS",
      "JOBS_HEALTH_INTERVAL_SECS",
      "JOBS_MAINTENANCE_INTERVAL_SECS",
    ] {
      let err = JobsConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/app"), (key, "0")]))
        .unwrap_err();
      assert!(
        matches!(err, ConfigError::Invalid { key: k, .. } if k == key),
        "{key} accepted 0"
      );
    }
  }

  #[test]
  fn oversized_expiry_is_rejected_instead_of_overflowing() {
    let err = JobsConfig::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/app"),
      ("JOBS_EXPIRE_IN_HOURS", u64::MAX.to_string().as_str()),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "JOBS_EXPIRE_IN_HOURS", .. }));
  }
}
