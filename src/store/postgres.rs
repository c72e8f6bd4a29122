//! PostgreSQL-backed [`JobStore`].
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of worker processes can
//! poll the same table. Singleton keys are enforced by a partial unique index
//! over non-terminal jobs.

use super::{
  tick_job, CancelOutcome, ClaimRequest, Connector, InsertOutcome, JobStore, StateCounts,
  SweepReport,
};
use crate::error::StoreError;
use crate::job::{ClaimToken, Job, JobId, JobKind, JobPayload, JobState, NewJob};
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use crate::schedule::{RecurringSchedule, ScheduleOutcome};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobkeeper_jobs (
    id               UUID PRIMARY KEY,
    seq              BIGSERIAL NOT NULL,
    kind             TEXT NOT NULL,
    payload          JSONB NOT NULL,
    priority         INTEGER NOT NULL DEFAULT 0,
    singleton_key    TEXT,
    state            TEXT NOT NULL DEFAULT 'created',
    not_before       TIMESTAMPTZ NOT NULL,
    expires_at       TIMESTAMPTZ NOT NULL,
    attempts         BIGINT NOT NULL DEFAULT 0,
    retry_limit      BIGINT NOT NULL,
    retry_delay_ms   BIGINT NOT NULL,
    retry_backoff    BOOLEAN NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL,
    started_at       TIMESTAMPTZ,
    completed_at     TIMESTAMPTZ,
    lease_expires_at TIMESTAMPTZ,
    claimed_by       TEXT,
    last_error       TEXT
);

CREATE INDEX IF NOT EXISTS jobkeeper_jobs_claim_idx
    ON jobkeeper_jobs (kind, state, not_before, priority DESC, seq);

CREATE UNIQUE INDEX IF NOT EXISTS jobkeeper_jobs_singleton_idx
    ON jobkeeper_jobs (kind, singleton_key)
    WHERE singleton_key IS NOT NULL AND state IN ('created', 'active', 'retry');

CREATE TABLE IF NOT EXISTS jobkeeper_schedules (
    kind            TEXT NOT NULL,
    cron_expression TEXT NOT NULL,
    timezone        TEXT NOT NULL,
    payload         JSONB NOT NULL,
    next_run_at     TIMESTAMPTZ NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (kind, cron_expression)
);
"#;

const JOB_COLUMNS: &str = "id, seq, kind, payload, priority, singleton_key, state, not_before, \
  expires_at, attempts, retry_limit, retry_delay_ms, retry_backoff, created_at, started_at, \
  completed_at, lease_expires_at, claimed_by, last_error";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
  id: JobId,
  seq: i64,
  kind: String,
  payload: Value,
  priority: i32,
  singleton_key: Option<String>,
  state: String,
  not_before: DateTime<Utc>,
  expires_at: DateTime<Utc>,
  attempts: i64,
  retry_limit: i64,
  retry_delay_ms: i64,
  retry_backoff: bool,
  created_at: DateTime<Utc>,
  started_at: Option<DateTime<Utc>>,
  completed_at: Option<DateTime<Utc>>,
  lease_expires_at: Option<DateTime<Utc>>,
  claimed_by: Option<String>,
  last_error: Option<String>,
}

impl TryFrom<JobRow> for Job {
  type Error = StoreError;

  fn try_from(row: JobRow) -> Result<Self, Self::Error> {
    let kind = JobKind::from_str(&row.kind).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let payload =
      JobPayload::from_json(kind, row.payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let state = JobState::from_str(&row.state).map_err(StoreError::Serialization)?;
    Ok(Job {
      id: row.id,
      payload,
      priority: row.priority,
      singleton_key: row.singleton_key,
      state,
      not_before: row.not_before,
      expires_at: row.expires_at,
      attempts: from_db_count("attempts", row.attempts)?,
      retry: RetryPolicy {
        limit: from_db_count("retry_limit", row.retry_limit)?,
        delay_base: Duration::from_millis(row.retry_delay_ms.max(0) as u64),
        backoff: row.retry_backoff,
      },
      created_at: row.created_at,
      started_at: row.started_at,
      completed_at: row.completed_at,
      lease_expires_at: row.lease_expires_at,
      claimed_by: row.claimed_by,
      last_error: row.last_error,
    })
  }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
  kind: String,
  cron_expression: String,
  timezone: String,
  payload: Value,
  next_run_at: DateTime<Utc>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for RecurringSchedule {
  type Error = StoreError;

  fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
    let kind = JobKind::from_str(&row.kind).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let payload_template =
      JobPayload::from_json(kind, row.payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(RecurringSchedule {
      payload_template,
      cron_expression: row.cron_expression,
      timezone: row.timezone,
      next_run_at: row.next_run_at,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

fn from_db_count(column: &str, value: i64) -> Result<u32, StoreError> {
  u32::try_from(value)
    .map_err(|_| StoreError::Serialization(format!("column {column} out of range: {value}")))
}

fn millis(duration: Duration) -> Result<i64, StoreError> {
  i64::try_from(duration.as_millis())
    .map_err(|_| StoreError::Backend(format!("duration {duration:?} out of range")))
}

/// Inserts `job` on `conn`, deferring to the live holder of its singleton key.
async fn insert_on(conn: &mut PgConnection, job: &NewJob) -> Result<InsertOutcome, StoreError> {
  let payload = job.payload.to_json()?;
  let kind = job.kind().as_str();

  // The holder can finish between the conflict and the lookup; try again then.
  for _ in 0..3 {
    let inserted: Option<JobId> = sqlx::query_scalar(
      r#"
      INSERT INTO jobkeeper_jobs (id, kind, payload, priority, singleton_key, state, not_before,
                                  expires_at, retry_limit, retry_delay_ms, retry_backoff, created_at)
      VALUES ($1, $2, $3, $4, $5, 'created', $6, $7, $8, $9, $10, $11)
      ON CONFLICT (kind, singleton_key)
        WHERE singleton_key IS NOT NULL AND state IN ('created', 'active', 'retry')
        DO NOTHING
      RETURNING id
      "#,
    )
    .bind(job.id)
    .bind(kind)
    .bind(&payload)
    .bind(job.priority)
    .bind(job.singleton_key.as_deref())
    .bind(job.not_before)
    .bind(job.expires_at)
    .bind(i64::from(job.retry.limit))
    .bind(millis(job.retry.delay_base)?)
    .bind(job.retry.backoff)
    .bind(job.created_at)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = inserted {
      return Ok(InsertOutcome::Inserted(id));
    }

    let existing: Option<JobId> = sqlx::query_scalar(
      r#"
      SELECT id FROM jobkeeper_jobs
      WHERE kind = $1 AND singleton_key = $2 AND state IN ('created', 'active', 'retry')
      "#,
    )
    .bind(kind)
    .bind(job.singleton_key.as_deref())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = existing {
      return Ok(InsertOutcome::Existing(id));
    }
  }
  Err(StoreError::Backend(format!(
    "singleton key {:?} kept changing hands during insert",
    job.singleton_key
  )))
}

/// A [`JobStore`] over a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
  pool: PgPool,
}

impl PostgresStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  /// Creates the tables and indexes if they do not exist.
  pub async fn ensure_schema(&self) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
    Ok(())
  }

  /// Runs an outcome write bound to `$1 = id, $2 = attempt`. Applies only while
  /// `token` is still the job's current claim.
  async fn guarded_update<'q>(
    &self,
    sql: &'q str,
    token: ClaimToken,
    bind: impl FnOnce(GuardedQuery<'q>) -> GuardedQuery<'q> + Send,
  ) -> Result<bool, StoreError> {
    let query = sqlx::query(sql).bind(token.job_id).bind(i64::from(token.attempt));
    let result = bind(query).execute(&self.pool).await?;
    let applied = result.rows_affected() == 1;
    if !applied {
      debug!(job_id = %token.job_id, attempt = token.attempt, "Ignoring outcome for stale claim.");
    }
    Ok(applied)
  }
}

type GuardedQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

#[async_trait]
impl JobStore for PostgresStore {
  async fn ping(&self) -> Result<(), StoreError> {
    sqlx::query("SELECT 1").execute(&self.pool).await?;
    Ok(())
  }

  async fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
    let mut conn = self.pool.acquire().await?;
    insert_on(&mut *conn, &job).await
  }

  async fn claim_jobs(&self, request: ClaimRequest<'_>) -> Result<Vec<Job>, StoreError> {
    if request.limit == 0 {
      return Ok(Vec::new());
    }
    let lease = ChronoDuration::from_std(request.lease)
      .map_err(|e| StoreError::Backend(format!("lease out of range: {e}")))?;
    let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);

    let sql = r#"
      WITH picked AS (
        SELECT id FROM jobkeeper_jobs
        WHERE kind = $1
          AND expires_at > $2
          AND (
            (state IN ('created', 'retry') AND not_before <= $2)
            OR (state = 'active'
                AND (lease_expires_at IS NULL OR lease_expires_at <= $2)
                AND attempts <= retry_limit)
          )
        ORDER BY priority DESC, seq ASC
        LIMIT $3
        FOR UPDATE SKIP LOCKED
      )
      UPDATE jobkeeper_jobs j
      SET state = 'active',
          attempts = j.attempts + 1,
          started_at = $2,
          lease_expires_at = $4,
          claimed_by = $5
      FROM picked
      WHERE j.id = picked.id
      RETURNING j.*
    "#;

    let mut rows: Vec<JobRow> = sqlx::query_as(sql)
      .bind(request.kind.as_str())
      .bind(request.now)
      .bind(limit)
      .bind(request.now + lease)
      .bind(request.worker_id)
      .fetch_all(&self.pool)
      .await?;

    // RETURNING does not preserve the CTE's order.
    rows.sort_by_key(|row| (std::cmp::Reverse(row.priority), row.seq));
    rows.into_iter().map(Job::try_from).collect()
  }

  async fn complete_job(&self, token: ClaimToken, now: DateTime<Utc>) -> Result<bool, StoreError> {
    self
      .guarded_update(
        r#"
        UPDATE jobkeeper_jobs
        SET state = 'completed', completed_at = $3, lease_expires_at = NULL
        WHERE id = $1 AND attempts = $2 AND state = 'active'
        "#,
        token,
        |q| q.bind(now),
      )
      .await
  }

  async fn retry_job(
    &self,
    token: ClaimToken,
    not_before: DateTime<Utc>,
    error: &str,
  ) -> Result<bool, StoreError> {
    let error = error.to_string();
    self
      .guarded_update(
        r#"
        UPDATE jobkeeper_jobs
        SET state = 'retry', not_before = $3, last_error = $4, lease_expires_at = NULL
        WHERE id = $1 AND attempts = $2 AND state = 'active'
        "#,
        token,
        |q| q.bind(not_before).bind(error),
      )
      .await
  }

  async fn fail_job(&self, token: ClaimToken, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let error = error.to_string();
    self
      .guarded_update(
        r#"
        UPDATE jobkeeper_jobs
        SET state = 'failed', completed_at = $3, last_error = $4, lease_expires_at = NULL
        WHERE id = $1 AND attempts = $2 AND state = 'active'
        "#,
        token,
        |q| q.bind(now).bind(error),
      )
      .await
  }

  async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError> {
    let cancelled = sqlx::query(
      r#"
      UPDATE jobkeeper_jobs
      SET state = 'cancelled', completed_at = $2
      WHERE id = $1 AND state IN ('created', 'retry')
      "#,
    )
    .bind(id)
    .bind(now)
    .execute(&self.pool)
    .await?;
    if cancelled.rows_affected() == 1 {
      return Ok(CancelOutcome::Cancelled);
    }

    let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobkeeper_jobs WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    match state {
      None => Ok(CancelOutcome::NotFound),
      Some(state) => match JobState::from_str(&state).map_err(StoreError::Serialization)? {
        JobState::Active => Ok(CancelOutcome::Active),
        // Moved through `active` between the two statements.
        JobState::Created | JobState::Retry => Ok(CancelOutcome::Active),
        terminal => Ok(CancelOutcome::AlreadyTerminal(terminal)),
      },
    }
  }

  async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
    let row: Option<JobRow> =
      sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobkeeper_jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
    row.map(Job::try_from).transpose()
  }

  async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
    let mut tx = self.pool.begin().await?;
    let expired = sqlx::query(
      r#"
      UPDATE jobkeeper_jobs
      SET state = 'expired', completed_at = $1, lease_expires_at = NULL
      WHERE state IN ('created', 'active', 'retry') AND expires_at <= $1
      "#,
    )
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let abandoned = sqlx::query(
      r#"
      UPDATE jobkeeper_jobs
      SET state = 'failed',
          completed_at = $1,
          lease_expires_at = NULL,
          last_error = 'lease expired after ' || attempts || ' attempts'
      WHERE state = 'active'
        AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
        AND attempts > retry_limit
      "#,
    )
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;

    Ok(SweepReport { expired, abandoned })
  }

  async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
    let rows: Vec<(String, i64)> =
      sqlx::query_as("SELECT state, COUNT(*) FROM jobkeeper_jobs GROUP BY state")
        .fetch_all(&self.pool)
        .await?;
    let mut counts = StateCounts::default();
    for (state, n) in rows {
      let state = JobState::from_str(&state).map_err(StoreError::Serialization)?;
      counts.add(state, n.max(0) as u64);
    }
    Ok(counts)
  }

  async fn upsert_schedule(&self, schedule: RecurringSchedule) -> Result<ScheduleOutcome, StoreError> {
    let payload = schedule.payload_template.to_json()?;
    // `xmax = 0` only for a freshly inserted row. No row at all means the
    // definition was already stored as is.
    let inserted: Option<bool> = sqlx::query_scalar(
      r#"
      INSERT INTO jobkeeper_schedules AS s
        (kind, cron_expression, timezone, payload, next_run_at, created_at, updated_at)
      VALUES ($1, $2, $3, $4, $5, $6, $7)
      ON CONFLICT (kind, cron_expression) DO UPDATE
        SET timezone = EXCLUDED.timezone,
            payload = EXCLUDED.payload,
            next_run_at = EXCLUDED.next_run_at,
            updated_at = EXCLUDED.updated_at
        WHERE (s.timezone, s.payload) IS DISTINCT FROM (EXCLUDED.timezone, EXCLUDED.payload)
      RETURNING (xmax = 0)
      "#,
    )
    .bind(schedule.kind().as_str())
    .bind(&schedule.cron_expression)
    .bind(&schedule.timezone)
    .bind(&payload)
    .bind(schedule.next_run_at)
    .bind(schedule.created_at)
    .bind(schedule.updated_at)
    .fetch_optional(&self.pool)
    .await?;

    Ok(match inserted {
      Some(true) => ScheduleOutcome::Created,
      Some(false) => ScheduleOutcome::Updated,
      None => ScheduleOutcome::Unchanged,
    })
  }

  async fn remove_schedule(&self, kind: JobKind, cron_expression: &str) -> Result<bool, StoreError> {
    let result =
      sqlx::query("DELETE FROM jobkeeper_schedules WHERE kind = $1 AND cron_expression = $2")
        .bind(kind.as_str())
        .bind(cron_expression.trim())
        .execute(&self.pool)
        .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StoreError> {
    let rows: Vec<ScheduleRow> = sqlx::query_as(
      "SELECT kind, cron_expression, timezone, payload, next_run_at, created_at, updated_at \
       FROM jobkeeper_schedules",
    )
    .fetch_all(&self.pool)
    .await?;
    let mut schedules = rows
      .into_iter()
      .map(RecurringSchedule::try_from)
      .collect::<Result<Vec<_>, _>>()?;
    schedules.sort_by(|a, b| a.key().cmp(&b.key()));
    Ok(schedules)
  }

  async fn materialize_due(
    &self,
    now: DateTime<Utc>,
    registry: &Registry,
  ) -> Result<Vec<JobId>, StoreError> {
    let mut tx = self.pool.begin().await?;
    let due: Vec<ScheduleRow> = sqlx::query_as(
      r#"
      SELECT kind, cron_expression, timezone, payload, next_run_at, created_at, updated_at
      FROM jobkeeper_schedules
      WHERE next_run_at <= $1
      ORDER BY next_run_at
      FOR UPDATE SKIP LOCKED
      "#,
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    let mut inserted = Vec::new();
    for row in due {
      let schedule = RecurringSchedule::try_from(row)?;
      match tick_job(&schedule, schedule.next_run_at, registry, now) {
        Ok(job) => {
          if let InsertOutcome::Inserted(id) = insert_on(&mut *tx, &job).await? {
            inserted.push(id);
          }
        }
        Err(e) => {
          warn!(kind = %schedule.kind(), cron = %schedule.cron_expression, error = %e, "Skipping schedule tick.");
        }
      }

      match schedule.cron().ok().and_then(|cron| cron.next_after(now)) {
        Some(next) => {
          sqlx::query(
            r#"
            UPDATE jobkeeper_schedules SET next_run_at = $3, updated_at = $4
            WHERE kind = $1 AND cron_expression = $2
            "#,
          )
          .bind(schedule.kind().as_str())
          .bind(&schedule.cron_expression)
          .bind(next)
          .bind(now)
          .execute(&mut *tx)
          .await?;
        }
        None => {
          warn!(kind = %schedule.kind(), cron = %schedule.cron_expression, "Schedule has no future ticks.");
        }
      }
    }
    tx.commit().await?;
    Ok(inserted)
  }

  async fn close(&self) -> Result<(), StoreError> {
    self.pool.close().await;
    Ok(())
  }
}

/// Opens a [`PostgresStore`] pool and makes sure the schema exists.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
  url: String,
  application_name: String,
  max_connections: u32,
  acquire_timeout: Duration,
}

impl PostgresConnector {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      application_name: "jobkeeper".to_string(),
      max_connections: 10,
      acquire_timeout: Duration::from_secs(10),
    }
  }

  /// Label shown in `pg_stat_activity`.
  pub fn application_name(mut self, name: impl Into<String>) -> Self {
    self.application_name = name.into();
    self
  }

  pub fn max_connections(mut self, max: u32) -> Self {
    self.max_connections = max;
    self
  }

  pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
    self.acquire_timeout = timeout;
    self
  }
}

#[async_trait]
impl Connector for PostgresConnector {
  async fn connect(&self) -> Result<Arc<dyn JobStore>, StoreError> {
    let options = PgConnectOptions::from_str(&self.url)?.application_name(&self.application_name);
    let pool = PgPoolOptions::new()
      .max_connections(self.max_connections)
      .acquire_timeout(self.acquire_timeout)
      .connect_with(options)
      .await?;
    let store = PostgresStore::new(pool);
    store.ensure_schema().await?;
    info!(application_name = %self.application_name, "Connected to PostgreSQL job store.");
    Ok(Arc::new(store))
  }
}
