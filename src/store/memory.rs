//! In-process [`JobStore`] used by tests and embedded setups.
//!
//! All state lives behind one mutex, so every operation is atomic with
//! respect to every other. Nothing survives the process.

use super::{
  tick_job, CancelOutcome, ClaimRequest, Connector, InsertOutcome, JobStore, StateCounts,
  SweepReport,
};
use crate::error::StoreError;
use crate::job::{ClaimToken, Job, JobId, JobKind, JobState, NewJob};
use crate::registry::Registry;
use crate::schedule::{RecurringSchedule, ScheduleKey, ScheduleOutcome};

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use tracing::{debug, warn};

#[derive(Debug)]
struct StoredJob {
  /// Insertion order, the FIFO tie-breaker between equal priorities.
  seq: u64,
  job: Job,
}

#[derive(Debug, Default)]
struct Inner {
  jobs: HashMap<JobId, StoredJob>,
  /// Last job inserted per (kind, singleton key). Only a holder that is still
  /// non-terminal blocks a new insert.
  singletons: HashMap<(JobKind, String), JobId>,
  next_seq: u64,
  schedules: HashMap<ScheduleKey, RecurringSchedule>,
  /// Schedules ordered by their next run, earliest first.
  due: PriorityQueue<ScheduleKey, Reverse<DateTime<Utc>>>,
  closed: bool,
}

impl Inner {
  fn singleton_holder(&self, kind: JobKind, key: &str) -> Option<JobId> {
    let id = self.singletons.get(&(kind, key.to_string()))?;
    self
      .jobs
      .get(id)
      .filter(|s| !s.job.state.is_terminal())
      .map(|s| s.job.id)
  }

  fn insert(&mut self, new: NewJob) -> InsertOutcome {
    if let Some(key) = new.singleton_key.as_deref() {
      if let Some(existing) = self.singleton_holder(new.kind(), key) {
        return InsertOutcome::Existing(existing);
      }
    }
    let seq = self.next_seq;
    self.next_seq += 1;
    let id = new.id;
    if let Some(key) = new.singleton_key.clone() {
      self.singletons.insert((new.kind(), key), id);
    }
    self.jobs.insert(
      id,
      StoredJob {
        seq,
        job: Job::from_new(new),
      },
    );
    InsertOutcome::Inserted(id)
  }

  /// The job behind `token`, if that claim is still the current one.
  fn claimed_mut(&mut self, token: ClaimToken) -> Option<&mut Job> {
    self
      .jobs
      .get_mut(&token.job_id)
      .map(|s| &mut s.job)
      .filter(|job| job.state == JobState::Active && job.attempts == token.attempt)
  }
}

fn lease_expired(job: &Job, now: DateTime<Utc>) -> bool {
  job.state == JobState::Active && job.lease_expires_at.map_or(true, |lease| lease <= now)
}

fn is_claimable(job: &Job, now: DateTime<Utc>) -> bool {
  if job.expires_at <= now {
    return false;
  }
  (job.state.is_claimable() && job.not_before <= now)
    || (lease_expired(job, now) && job.retry.has_retries_left(job.attempts))
}

/// A [`JobStore`] held entirely in memory.
///
/// Cloning yields another handle onto the same state, which lets tests keep
/// a handle for inspection while the queue owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  inner: Arc<Mutex<Inner>>,
  unreachable: Arc<AtomicBool>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulates losing (or regaining) the connection to the store. While
  /// unreachable every operation fails with [`StoreError::Unreachable`].
  pub fn set_reachable(&self, reachable: bool) {
    self.unreachable.store(!reachable, Ordering::SeqCst);
  }

  pub fn is_closed(&self) -> bool {
    self.inner.lock().closed
  }

  /// Every stored job, in insertion order.
  pub fn jobs(&self) -> Vec<Job> {
    let inner = self.inner.lock();
    let mut stored: Vec<&StoredJob> = inner.jobs.values().collect();
    stored.sort_by_key(|s| s.seq);
    stored.into_iter().map(|s| s.job.clone()).collect()
  }

  /// Test hook: rewrites a stored job in place.
  pub fn update_job(&self, id: JobId, f: impl FnOnce(&mut Job)) -> bool {
    match self.inner.lock().jobs.get_mut(&id) {
      Some(stored) => {
        f(&mut stored.job);
        true
      }
      None => false,
    }
  }

  fn reopen(&self) {
    self.inner.lock().closed = false;
  }

  fn check_reachable(&self) -> Result<(), StoreError> {
    if self.unreachable.load(Ordering::SeqCst) {
      Err(StoreError::Unreachable("memory store marked unreachable".to_string()))
    } else {
      Ok(())
    }
  }

  /// Runs `f` under the lock after the reachability and open checks.
  fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Result<T, StoreError> {
    self.check_reachable()?;
    let mut inner = self.inner.lock();
    if inner.closed {
      return Err(StoreError::Closed);
    }
    Ok(f(&mut inner))
  }
}

#[async_trait]
impl JobStore for MemoryStore {
  async fn ping(&self) -> Result<(), StoreError> {
    self.with_inner(|_| ())
  }

  async fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
    self.with_inner(|inner| inner.insert(job))
  }

  async fn claim_jobs(&self, request: ClaimRequest<'_>) -> Result<Vec<Job>, StoreError> {
    if request.limit == 0 {
      return Ok(Vec::new());
    }
    let lease = ChronoDuration::from_std(request.lease)
      .map_err(|e| StoreError::Backend(format!("lease out of range: {e}")))?;

    self.with_inner(|inner| {
      let mut eligible: Vec<(Reverse<i32>, u64, JobId)> = inner
        .jobs
        .values()
        .filter(|s| s.job.kind() == request.kind && is_claimable(&s.job, request.now))
        .map(|s| (Reverse(s.job.priority), s.seq, s.job.id))
        .collect();
      eligible.sort_unstable();

      let mut claimed = Vec::with_capacity(eligible.len().min(request.limit));
      for (_, _, id) in eligible.into_iter().take(request.limit) {
        let Some(stored) = inner.jobs.get_mut(&id) else {
          continue;
        };
        let job = &mut stored.job;
        if job.state == JobState::Active {
          debug!(job_id = %job.id, attempt = job.attempts, "Reclaiming job with expired lease.");
        }
        job.state = JobState::Active;
        job.attempts += 1;
        job.started_at = Some(request.now);
        job.lease_expires_at = Some(request.now + lease);
        job.claimed_by = Some(request.worker_id.to_string());
        claimed.push(job.clone());
      }
      claimed
    })
  }

  async fn complete_job(&self, token: ClaimToken, now: DateTime<Utc>) -> Result<bool, StoreError> {
    self.with_inner(|inner| match inner.claimed_mut(token) {
      Some(job) => {
        job.state = JobState::Completed;
        job.completed_at = Some(now);
        job.lease_expires_at = None;
        true
      }
      None => false,
    })
  }

  async fn retry_job(
    &self,
    token: ClaimToken,
    not_before: DateTime<Utc>,
    error: &str,
  ) -> Result<bool, StoreError> {
    self.with_inner(|inner| match inner.claimed_mut(token) {
      Some(job) => {
        job.state = JobState::Retry;
        job.not_before = not_before;
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());
        true
      }
      None => false,
    })
  }

  async fn fail_job(&self, token: ClaimToken, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
    self.with_inner(|inner| match inner.claimed_mut(token) {
      Some(job) => {
        job.state = JobState::Failed;
        job.completed_at = Some(now);
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());
        true
      }
      None => false,
    })
  }

  async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError> {
    self.with_inner(|inner| match inner.jobs.get_mut(&id) {
      None => CancelOutcome::NotFound,
      Some(stored) => {
        let job = &mut stored.job;
        match job.state {
          JobState::Created | JobState::Retry => {
            job.state = JobState::Cancelled;
            job.completed_at = Some(now);
            CancelOutcome::Cancelled
          }
          JobState::Active => CancelOutcome::Active,
          terminal => CancelOutcome::AlreadyTerminal(terminal),
        }
      }
    })
  }

  async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
    self.with_inner(|inner| inner.jobs.get(&id).map(|s| s.job.clone()))
  }

  async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
    self.with_inner(|inner| {
      let mut report = SweepReport::default();
      for job in inner.jobs.values_mut().map(|s| &mut s.job) {
        if job.state.is_terminal() {
          continue;
        }
        if job.expires_at <= now {
          job.state = JobState::Expired;
          job.completed_at = Some(now);
          job.lease_expires_at = None;
          report.expired += 1;
        } else if lease_expired(job, now) && !job.retry.has_retries_left(job.attempts) {
          job.state = JobState::Failed;
          job.completed_at = Some(now);
          job.lease_expires_at = None;
          job.last_error = Some(format!("lease expired after {} attempts", job.attempts));
          report.abandoned += 1;
        }
      }
      let jobs = &inner.jobs;
      inner
        .singletons
        .retain(|_, id| jobs.get(id).is_some_and(|s| !s.job.state.is_terminal()));
      report
    })
  }

  async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
    self.with_inner(|inner| {
      let mut counts = StateCounts::default();
      for stored in inner.jobs.values() {
        counts.add(stored.job.state, 1);
      }
      counts
    })
  }

  async fn upsert_schedule(&self, schedule: RecurringSchedule) -> Result<ScheduleOutcome, StoreError> {
    self.with_inner(|inner| {
      let key = schedule.key();
      let outcome = match inner.schedules.get(&key) {
        Some(existing) if existing.same_definition(&schedule) => return ScheduleOutcome::Unchanged,
        Some(existing) => {
          let created_at = existing.created_at;
          inner.schedules.insert(
            key.clone(),
            RecurringSchedule {
              created_at,
              ..schedule.clone()
            },
          );
          ScheduleOutcome::Updated
        }
        None => {
          inner.schedules.insert(key.clone(), schedule.clone());
          ScheduleOutcome::Created
        }
      };
      inner.due.push(key, Reverse(schedule.next_run_at));
      outcome
    })
  }

  async fn remove_schedule(&self, kind: JobKind, cron_expression: &str) -> Result<bool, StoreError> {
    self.with_inner(|inner| {
      let key = (kind, cron_expression.trim().to_string());
      inner.due.remove(&key);
      inner.schedules.remove(&key).is_some()
    })
  }

  async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StoreError> {
    self.with_inner(|inner| {
      let mut schedules: Vec<RecurringSchedule> = inner.schedules.values().cloned().collect();
      schedules.sort_by(|a, b| a.key().cmp(&b.key()));
      schedules
    })
  }

  async fn materialize_due(
    &self,
    now: DateTime<Utc>,
    registry: &Registry,
  ) -> Result<Vec<JobId>, StoreError> {
    self.with_inner(|inner| {
      let mut inserted = Vec::new();
      while let Some((_, Reverse(next_run_at))) = inner.due.peek() {
        if *next_run_at > now {
          break;
        }
        let Some((key, Reverse(tick))) = inner.due.pop() else {
          break;
        };
        let Some(schedule) = inner.schedules.get(&key).cloned() else {
          continue;
        };

        match tick_job(&schedule, tick, registry, now) {
          Ok(job) => {
            if let InsertOutcome::Inserted(id) = inner.insert(job) {
              inserted.push(id);
            }
          }
          Err(e) => {
            warn!(kind = %schedule.kind(), cron = %schedule.cron_expression, error = %e, "Skipping schedule tick.");
          }
        }

        // Missed ticks collapse into the one above.
        let next = schedule.cron().ok().and_then(|cron| cron.next_after(now));
        match next {
          Some(next) => {
            if let Some(stored) = inner.schedules.get_mut(&key) {
              stored.next_run_at = next;
              stored.updated_at = now;
            }
            inner.due.push(key, Reverse(next));
          }
          None => {
            warn!(kind = %schedule.kind(), cron = %schedule.cron_expression, "Schedule has no future ticks.");
          }
        }
      }
      inserted
    })
  }

  async fn close(&self) -> Result<(), StoreError> {
    self.check_reachable()?;
    self.inner.lock().closed = true;
    Ok(())
  }
}

/// Hands out handles onto one shared [`MemoryStore`], reopening it on each
/// connect.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
  store: MemoryStore,
}

impl MemoryConnector {
  pub fn new(store: MemoryStore) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &MemoryStore {
    &self.store
  }
}

#[async_trait]
impl Connector for MemoryConnector {
  async fn connect(&self) -> Result<Arc<dyn JobStore>, StoreError> {
    self.store.check_reachable()?;
    self.store.reopen();
    Ok(Arc::new(self.store.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{CleanupExpiredSessions, JobDefaults, JobOptions, JobPayload};
  use std::time::Duration;

  fn cleanup_job(options: JobOptions, now: DateTime<Utc>) -> NewJob {
    let payload = JobPayload::from(CleanupExpiredSessions {
      batch_size: Some(500),
      older_than_days: None,
    });
    NewJob::build(payload, options, &JobDefaults::default(), now).unwrap()
  }

  fn claim(now: DateTime<Utc>, limit: usize) -> ClaimRequest<'static> {
    ClaimRequest {
      kind: JobKind::CleanupExpiredSessions,
      limit,
      lease: Duration::from_secs(60),
      worker_id: "test-worker",
      now,
    }
  }

  #[tokio::test]
  async fn claims_follow_priority_then_fifo() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let low = store.insert_job(cleanup_job(JobOptions::new(), now)).await.unwrap().id();
    let high = store
      .insert_job(cleanup_job(JobOptions::new().priority(5), now))
      .await
      .unwrap()
      .id();
    let low_second = store.insert_job(cleanup_job(JobOptions::new(), now)).await.unwrap().id();

    let claimed: Vec<JobId> = store
      .claim_jobs(claim(now, 10))
      .await
      .unwrap()
      .into_iter()
      .map(|j| j.id)
      .collect();
    assert_eq!(claimed, vec![high, low, low_second]);
    assert!(store.claim_jobs(claim(now, 10)).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn stale_token_cannot_overwrite_reclaimed_job() {
    let store = MemoryStore::new();
    let now = Utc::now();
    store.insert_job(cleanup_job(JobOptions::new(), now)).await.unwrap();

    let first = store.claim_jobs(claim(now, 1)).await.unwrap().remove(0);
    let later = now + ChronoDuration::seconds(120);
    let second = store.claim_jobs(claim(later, 1)).await.unwrap().remove(0);
    assert_eq!(second.attempts, 2);

    assert!(!store.complete_job(first.claim_token(), later).await.unwrap());
    assert!(store.complete_job(second.claim_token(), later).await.unwrap());
  }

  #[tokio::test]
  async fn sweep_expires_and_abandons() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let short = store
      .insert_job(cleanup_job(JobOptions::new().expire_in(Duration::from_secs(10)), now))
      .await
      .unwrap()
      .id();
    let exhausted = store
      .insert_job(cleanup_job(JobOptions::new().retry_limit(0), now))
      .await
      .unwrap()
      .id();
    store.claim_jobs(claim(now, 10)).await.unwrap();

    let report = store.sweep(now + ChronoDuration::seconds(90)).await.unwrap();
    assert_eq!(report, SweepReport { expired: 1, abandoned: 1 });
    assert_eq!(store.get_job(short).await.unwrap().unwrap().state, JobState::Expired);
    assert_eq!(store.get_job(exhausted).await.unwrap().unwrap().state, JobState::Failed);
  }

  #[tokio::test]
  async fn singleton_key_is_released_once_holder_finishes() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let keyed = || cleanup_job(JobOptions::new().singleton_key("nightly"), now);

    let first = store.insert_job(keyed()).await.unwrap();
    assert!(matches!(first, InsertOutcome::Inserted(_)));
    assert_eq!(store.insert_job(keyed()).await.unwrap(), InsertOutcome::Existing(first.id()));

    let claimed = store.claim_jobs(claim(now, 1)).await.unwrap().remove(0);
    assert!(store.complete_job(claimed.claim_token(), now).await.unwrap());

    let second = store.insert_job(keyed()).await.unwrap();
    assert!(matches!(second, InsertOutcome::Inserted(id) if id != first.id()));
    assert_eq!(store.insert_job(keyed()).await.unwrap(), InsertOutcome::Existing(second.id()));
  }

  #[tokio::test]
  async fn finished_singletons_do_not_pile_up_in_the_index() {
    let store = MemoryStore::new();
    let now = Utc::now();
    for i in 0..50 {
      let key = format!("tick-{i}");
      let id = store
        .insert_job(cleanup_job(JobOptions::new().singleton_key(key), now))
        .await
        .unwrap()
        .id();
      store.cancel_job(id, now).await.unwrap();
    }
    let live = store
      .insert_job(cleanup_job(JobOptions::new().singleton_key("live"), now))
      .await
      .unwrap()
      .id();

    store.sweep(now).await.unwrap();

    let inner = store.inner.lock();
    assert_eq!(inner.singletons.len(), 1);
    assert_eq!(
      inner.singletons.get(&(JobKind::CleanupExpiredSessions, "live".to_string())),
      Some(&live)
    );
  }

  #[tokio::test]
  async fn closed_and_unreachable_stores_reject_calls() {
    let store = MemoryStore::new();
    store.set_reachable(false);
    assert!(matches!(store.ping().await, Err(StoreError::Unreachable(_))));
    store.set_reachable(true);
    store.close().await.unwrap();
    assert_eq!(store.ping().await, Err(StoreError::Closed));
  }
}
