//! Durable store primitives behind a task queue

use super::{settle_failure, JobCounts, JobRecord, JobState, Settlement, TaskQueue, LEASE_EXPIRED};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;
use uuid::Uuid;

/// Storage operations a broker must provide.
///
/// A job moves pending -> active on `claim`, then either leaves the
/// broker (`complete`), goes back to pending with a delay (`retry_later`)
/// or lands in the bounded failed list (`bury`). A job still active when
/// its lease runs out is reclaimed by the next `claim` as a failed attempt.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Store a new pending job
    async fn enqueue(&self, record: JobRecord) -> Result<()>;

    /// Reclaim expired leases, then take the oldest due job, mark it
    /// active and count the attempt
    async fn claim(&self, queue: TaskQueue, now: DateTime<Utc>) -> Result<Option<JobRecord>>;

    /// Remove a successfully finished job
    async fn complete(&self, record: &JobRecord) -> Result<()>;

    /// Return an active job to pending, not claimable before `available_at`.
    /// No-op for a job that is no longer active.
    async fn retry_later(&self, record: JobRecord, available_at: DateTime<Utc>) -> Result<()>;

    /// Move an exhausted active job to the failed list, keeping the newest
    /// `keep_failed`. No-op for a job that is no longer active.
    async fn bury(&self, record: JobRecord) -> Result<()>;

    /// Settle an attempt that ended without a result, retrying or burying
    /// it like a handler failure
    async fn abandon(&self, mut record: JobRecord, reason: &str, now: DateTime<Utc>) -> Result<()> {
        record.last_error = Some(reason.to_string());
        match settle_failure(&record, now) {
            Settlement::Retry { available_at } => self.retry_later(record, available_at).await,
            Settlement::Exhausted => self.bury(record).await,
        }
    }

    /// Retained failed jobs, newest first
    async fn failed_jobs(&self, queue: TaskQueue) -> Result<Vec<JobRecord>>;

    async fn counts(&self, queue: TaskQueue) -> Result<JobCounts>;

    /// Release the connection; later calls fail
    async fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct Lanes {
    waiting: VecDeque<JobRecord>,
    delayed: Vec<JobRecord>,
    active: HashMap<Uuid, JobRecord>,
    failed: VecDeque<JobRecord>,
}

impl Lanes {
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .active
            .values()
            .filter(|job| job.lease_expired(now))
            .map(|job| job.id)
            .collect();

        for id in expired {
            let Some(mut record) = self.active.remove(&id) else {
                continue;
            };
            warn!(queue = %record.queue, job_id = %id, attempt = record.attempts_made, "Job lease expired, reclaiming");
            record.last_error = Some(LEASE_EXPIRED.to_string());
            match settle_failure(&record, now) {
                Settlement::Retry { available_at } => self.push_delayed(record, available_at),
                Settlement::Exhausted => self.push_failed(record),
            }
        }
    }

    fn push_delayed(&mut self, mut record: JobRecord, available_at: DateTime<Utc>) {
        record.state = JobState::Pending;
        record.available_at = available_at;
        record.active_until = None;
        self.delayed.push(record);
    }

    fn push_failed(&mut self, mut record: JobRecord) {
        record.state = JobState::Failed;
        record.active_until = None;
        let keep = record.keep_failed;
        self.failed.push_front(record);
        self.failed.truncate(keep);
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|job| job.is_due(now));
        self.delayed = pending;
        due.sort_by_key(|job| job.available_at);
        self.waiting.extend(due);
    }
}

/// In-process broker for tests and single-process hosts
#[derive(Default)]
pub struct MemoryBroker {
    lanes: Mutex<HashMap<TaskQueue, Lanes>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> Result<MutexGuard<'_, HashMap<TaskQueue, Lanes>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::QueueError {
                message: "broker is closed".to_string(),
            });
        }
        Ok(self.lanes.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(&self, mut record: JobRecord) -> Result<()> {
        record.state = JobState::Pending;
        let mut lanes = self.lanes()?;
        lanes.entry(record.queue).or_default().waiting.push_back(record);
        Ok(())
    }

    async fn claim(&self, queue: TaskQueue, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let mut lanes = self.lanes()?;
        let lane = lanes.entry(queue).or_default();
        lane.reclaim_expired(now);
        lane.promote_due(now);

        let Some(mut record) = lane.waiting.pop_front() else {
            return Ok(None);
        };
        record.begin_attempt(now);
        lane.active.insert(record.id, record.clone());
        Ok(Some(record))
    }

    async fn complete(&self, record: &JobRecord) -> Result<()> {
        let mut lanes = self.lanes()?;
        if let Some(lane) = lanes.get_mut(&record.queue) {
            lane.active.remove(&record.id);
        }
        Ok(())
    }

    async fn retry_later(&self, record: JobRecord, available_at: DateTime<Utc>) -> Result<()> {
        let mut lanes = self.lanes()?;
        let lane = lanes.entry(record.queue).or_default();
        if lane.active.remove(&record.id).is_some() {
            lane.push_delayed(record, available_at);
        }
        Ok(())
    }

    async fn bury(&self, record: JobRecord) -> Result<()> {
        let mut lanes = self.lanes()?;
        let lane = lanes.entry(record.queue).or_default();
        if lane.active.remove(&record.id).is_some() {
            lane.push_failed(record);
        }
        Ok(())
    }

    async fn failed_jobs(&self, queue: TaskQueue) -> Result<Vec<JobRecord>> {
        let lanes = self.lanes()?;
        Ok(lanes
            .get(&queue)
            .map(|lane| lane.failed.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn counts(&self, queue: TaskQueue) -> Result<JobCounts> {
        let lanes = self.lanes()?;
        Ok(lanes
            .get(&queue)
            .map(|lane| JobCounts {
                waiting: lane.waiting.len(),
                delayed: lane.delayed.len(),
                active: lane.active.len(),
                failed: lane.failed.len(),
            })
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobOptions;
    use serde_json::json;
    use std::time::Duration;

    fn options(keep_failed: usize) -> JobOptions {
        JobOptions {
            attempts: 2,
            backoff: Duration::from_millis(100),
            keep_failed,
            lease: Duration::from_secs(30),
        }
    }

    fn record(n: u64, keep_failed: usize) -> JobRecord {
        JobRecord::new(
            TaskQueue::ResearchJobs,
            "researchJob",
            json!({ "n": n }),
            &options(keep_failed),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_counts_attempts() {
        let broker = MemoryBroker::new();
        let first = record(1, 10);
        let second = record(2, 10);
        broker.enqueue(first.clone()).await.unwrap();
        broker.enqueue(second.clone()).await.unwrap();

        let claimed = broker
            .claim(TaskQueue::ResearchJobs, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.attempts_made, 1);
        assert_eq!(claimed.state, JobState::Active);

        let counts = broker.counts(TaskQueue::ResearchJobs).await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 1);

        // Queues are independent
        assert!(broker
            .claim(TaskQueue::ComplianceChecks, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable_until_due() {
        let broker = MemoryBroker::new();
        broker.enqueue(record(1, 10)).await.unwrap();

        let now = Utc::now();
        let claimed = broker.claim(TaskQueue::ResearchJobs, now).await.unwrap().unwrap();
        let due = now + chrono::Duration::seconds(5);
        broker.retry_later(claimed, due).await.unwrap();

        assert!(broker.claim(TaskQueue::ResearchJobs, now).await.unwrap().is_none());
        assert_eq!(broker.counts(TaskQueue::ResearchJobs).await.unwrap().delayed, 1);

        let again = broker.claim(TaskQueue::ResearchJobs, due).await.unwrap().unwrap();
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_failed_list_is_trimmed_newest_first() {
        let broker = MemoryBroker::new();
        for n in 0..3 {
            broker.enqueue(record(n, 2)).await.unwrap();
            let claimed = broker
                .claim(TaskQueue::ResearchJobs, Utc::now())
                .await
                .unwrap()
                .unwrap();
            broker.bury(claimed).await.unwrap();
        }

        let failed = broker.failed_jobs(TaskQueue::ResearchJobs).await.unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].payload, json!({ "n": 2 }));
        assert!(failed.iter().all(|job| job.state == JobState::Failed));
        assert_eq!(broker.counts(TaskQueue::ResearchJobs).await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_as_failed_attempt() {
        let broker = MemoryBroker::new();
        broker.enqueue(record(1, 10)).await.unwrap();

        let now = Utc::now();
        let claimed = broker.claim(TaskQueue::ResearchJobs, now).await.unwrap().unwrap();
        assert_eq!(claimed.active_until, Some(now + chrono::Duration::seconds(30)));

        // Within the lease nothing moves
        let within = now + chrono::Duration::seconds(10);
        assert!(broker.claim(TaskQueue::ResearchJobs, within).await.unwrap().is_none());
        assert_eq!(broker.counts(TaskQueue::ResearchJobs).await.unwrap().active, 1);

        // Past the lease the job is retried after its backoff
        let expired = now + chrono::Duration::seconds(31);
        assert!(broker.claim(TaskQueue::ResearchJobs, expired).await.unwrap().is_none());
        let counts = broker.counts(TaskQueue::ResearchJobs).await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.delayed, 1);

        let later = expired + chrono::Duration::seconds(1);
        let again = broker.claim(TaskQueue::ResearchJobs, later).await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts_made, 2);
        assert_eq!(again.last_error.as_deref(), Some(LEASE_EXPIRED));

        // Last attempt expiring buries the job
        let last = later + chrono::Duration::seconds(31);
        assert!(broker.claim(TaskQueue::ResearchJobs, last).await.unwrap().is_none());
        let failed = broker.failed_jobs(TaskQueue::ResearchJobs).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].state, JobState::Failed);
        assert!(failed[0].active_until.is_none());
    }

    #[tokio::test]
    async fn test_settling_a_reclaimed_job_is_ignored() {
        let broker = MemoryBroker::new();
        broker.enqueue(record(1, 10)).await.unwrap();

        let now = Utc::now();
        let stale = broker.claim(TaskQueue::ResearchJobs, now).await.unwrap().unwrap();
        let expired = now + chrono::Duration::seconds(31);
        broker.claim(TaskQueue::ResearchJobs, expired).await.unwrap();

        broker.retry_later(stale.clone(), expired).await.unwrap();
        broker.bury(stale).await.unwrap();

        let counts = broker.counts(TaskQueue::ResearchJobs).await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn test_abandon_retries_then_buries() {
        let broker = MemoryBroker::new();
        broker.enqueue(record(1, 10)).await.unwrap();

        let now = Utc::now();
        let first = broker.claim(TaskQueue::ResearchJobs, now).await.unwrap().unwrap();
        broker.abandon(first, "worker stopped", now).await.unwrap();
        assert_eq!(broker.counts(TaskQueue::ResearchJobs).await.unwrap().delayed, 1);

        let due = now + chrono::Duration::milliseconds(100);
        let second = broker.claim(TaskQueue::ResearchJobs, due).await.unwrap().unwrap();
        assert_eq!(second.last_error.as_deref(), Some("worker stopped"));
        broker.abandon(second, "worker stopped", due).await.unwrap();

        let failed = broker.failed_jobs(TaskQueue::ResearchJobs).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 2);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_calls() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        assert!(broker.enqueue(record(1, 1)).await.is_err());
    }
}
