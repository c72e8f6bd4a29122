//! Queue status summary with alert thresholds, as printed by `jobs-status`.

use crate::job::JobState;
use crate::store::StateCounts;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Active jobs above which a backlog warning is raised.
pub const ACTIVE_WARN_THRESHOLD: u64 = 100;
/// Failed jobs above which a warning is raised.
pub const FAILED_WARN_THRESHOLD: u64 = 50;
/// Active jobs at or above which the queue is unhealthy.
pub const ACTIVE_UNHEALTHY_THRESHOLD: u64 = 1000;
/// Failed jobs at or above which the queue is unhealthy.
pub const FAILED_UNHEALTHY_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
  pub generated_at: DateTime<Utc>,
  pub counts: StateCounts,
  pub healthy: bool,
  pub warnings: Vec<String>,
  pub recommendations: Vec<String>,
}

impl StatusReport {
  pub fn from_counts(counts: StateCounts, generated_at: DateTime<Utc>) -> Self {
    let mut warnings = Vec::new();
    if counts.active > 0 {
      warnings.push(format!("{} jobs are currently active", counts.active));
    }
    if counts.active > ACTIVE_WARN_THRESHOLD {
      warnings.push(format!("High number of active jobs: {}", counts.active));
    }
    if counts.failed > FAILED_WARN_THRESHOLD {
      warnings.push(format!("High number of failed jobs: {}", counts.failed));
    }

    let backlog = counts.active >= ACTIVE_UNHEALTHY_THRESHOLD;
    let failing = counts.failed >= FAILED_UNHEALTHY_THRESHOLD;
    let mut recommendations = Vec::new();
    if backlog {
      recommendations.push("Consider scaling up worker processes".to_string());
      recommendations.push("Check worker performance and bottlenecks".to_string());
    }
    if failing {
      recommendations.push("Investigate failed job patterns".to_string());
      recommendations.push("Check error logs for common failure causes".to_string());
      recommendations.push("Consider adjusting retry policies".to_string());
    }

    Self {
      generated_at,
      counts,
      healthy: !backlog && !failing,
      warnings,
      recommendations,
    }
  }
}

impl fmt::Display for StatusReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "=== Queue Status ({}) ===", self.generated_at.to_rfc3339())?;
    for state in JobState::ALL {
      writeln!(f, "{:>10}: {}", state.as_str(), self.counts.get(state))?;
    }
    if !self.warnings.is_empty() {
      writeln!(f, "\n=== Warnings ===")?;
      for warning in &self.warnings {
        writeln!(f, "- {warning}")?;
      }
    }
    writeln!(f, "\n=== Health Status ===")?;
    writeln!(
      f,
      "Overall Health: {}",
      if self.healthy { "Healthy" } else { "Unhealthy" }
    )?;
    if !self.recommendations.is_empty() {
      writeln!(f, "\nRecommendations:")?;
      for recommendation in &self.recommendations {
        writeln!(f, "- {recommendation}")?;
      }
    }
    Ok(())
  }
}
