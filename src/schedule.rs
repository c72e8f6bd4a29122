//! Recurring schedule records and CRON evaluation.

use crate::error::ValidationError;
use crate::job::{JobKind, JobPayload};

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronExpr;

pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Schedules are unique per (kind, cron expression).
pub type ScheduleKey = (JobKind, String);

/// A validated CRON expression bound to a timezone.
///
/// Accepts the classic 5-field crontab form (`min hour dom month dow`) as
/// well as the 6/7-field form with a leading seconds field.
///
/// Day-of-week numbers depend on the form. In 5-field expressions they are
/// crontab numbers (0 and 7 = Sunday, 1 = Monday). The 6/7-field form is
/// passed to the `cron` crate untouched, where 1 = Sunday. Names like
/// `MON-FRI` mean the same in both.
#[derive(Debug, Clone)]
pub struct CronSchedule {
  expression: String,
  timezone: Tz,
  parsed: CronExpr,
}

impl CronSchedule {
  pub fn parse(expression: &str, timezone: &str) -> Result<Self, ValidationError> {
    let normalized = normalize_expression(expression)?;
    let parsed = CronExpr::from_str(&normalized).map_err(|e| ValidationError::InvalidCron {
      expression: expression.to_string(),
      reason: e.to_string(),
    })?;
    let timezone = timezone
      .parse::<Tz>()
      .map_err(|_| ValidationError::InvalidTimezone(timezone.to_string()))?;
    Ok(Self {
      expression: expression.trim().to_string(),
      timezone,
      parsed,
    })
  }

  /// The expression as registered (not normalized).
  pub fn expression(&self) -> &str {
    &self.expression
  }

  pub fn timezone(&self) -> Tz {
    self.timezone
  }

  /// First tick strictly after `reference`, evaluated in the schedule's
  /// timezone and returned in UTC.
  pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local = reference.with_timezone(&self.timezone);
    self
      .parsed
      .after(&local)
      .next()
      .map(|dt| dt.with_timezone(&Utc))
  }
}

fn normalize_expression(expression: &str) -> Result<String, ValidationError> {
  let fields: Vec<&str> = expression.split_whitespace().collect();
  match fields.len() {
    5 => {
      let day_of_week =
        crontab_day_of_week(fields[4]).map_err(|reason| ValidationError::InvalidCron {
          expression: expression.to_string(),
          reason,
        })?;
      Ok(format!("0 {} {day_of_week}", fields[..4].join(" ")))
    }
    6 | 7 => Ok(fields.join(" ")),
    n => Err(ValidationError::InvalidCron {
      expression: expression.to_string(),
      reason: format!("expected 5, 6 or 7 fields, found {n}"),
    }),
  }
}

/// Rewrites a crontab day-of-week field (0-7, 0 and 7 = Sunday) into the
/// `cron` crate's numbering (1-7, 1 = Sunday).
///
/// Numeric items, ranges and steps are expanded into an explicit list, so
/// `1-5` becomes `2,3,4,5,6` and `5-7` (Friday to Sunday) becomes `1,6,7`.
/// Named items pass through unchanged.
fn crontab_day_of_week(field: &str) -> Result<String, String> {
  if field == "*" || field == "?" {
    return Ok(field.to_string());
  }

  let parse_day = |s: &str| -> Result<u32, String> {
    match s.parse::<u32>() {
      Ok(day) if day <= 7 => Ok(day),
      _ => Err(format!("day of week `{s}` is not in 0-7")),
    }
  };

  let mut days = BTreeSet::new();
  let mut named = Vec::new();
  for item in field.split(',') {
    if item.chars().any(|c| c.is_ascii_alphabetic()) {
      named.push(item.to_string());
      continue;
    }
    let (range, step) = match item.split_once('/') {
      Some((range, step)) => match step.parse::<usize>() {
        Ok(step) if step > 0 => (range, Some(step)),
        _ => return Err(format!("invalid step in day of week `{item}`")),
      },
      None => (item, None),
    };
    let (start, end) = if range == "*" {
      (0, 6)
    } else if let Some((start, end)) = range.split_once('-') {
      (parse_day(start)?, parse_day(end)?)
    } else {
      let day = parse_day(range)?;
      // `n/step` runs from n to the end of the week.
      (day, if step.is_some() { 6 } else { day })
    };
    if start > end {
      return Err(format!("day of week range `{range}` is reversed"));
    }
    for day in (start..=end).step_by(step.unwrap_or(1)) {
      days.insert(day % 7 + 1);
    }
  }

  let mut items: Vec<String> = days.iter().map(u32::to_string).collect();
  items.extend(named);
  Ok(items.join(","))
}

/// A template that periodically materializes a job.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringSchedule {
  pub payload_template: JobPayload,
  pub cron_expression: String,
  pub timezone: String,
  /// Next tick at which the store materializes a job.
  pub next_run_at: DateTime<Utc>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl RecurringSchedule {
  pub fn kind(&self) -> JobKind {
    self.payload_template.kind()
  }

  pub fn key(&self) -> ScheduleKey {
    (self.kind(), self.cron_expression.clone())
  }

  /// Same template, expression and timezone; the bookkeeping fields are ignored.
  pub fn same_definition(&self, other: &RecurringSchedule) -> bool {
    self.payload_template == other.payload_template
      && self.cron_expression == other.cron_expression
      && self.timezone == other.timezone
  }

  /// Singleton key of the job materialized for tick `at`. Shared by every
  /// process materializing the same tick, so only one job results.
  pub fn tick_singleton_key(&self, at: DateTime<Utc>) -> String {
    format!("schedule:{}@{}", self.cron_expression, at.timestamp())
  }

  pub fn cron(&self) -> Result<CronSchedule, ValidationError> {
    CronSchedule::parse(&self.cron_expression, &self.timezone)
  }
}

/// Result of registering a recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
  Created,
  Updated,
  Unchanged,
}
