//! Background job queue
//!
//! Durable, retryable task submission for long-running work:
//! - Per task-type queues ("compliance-checks", "research-jobs")
//! - Bounded attempts with exponential backoff
//! - Failed jobs retained up to a bounded count for inspection
//! - Best-effort: a missing or unreachable broker yields a typed
//!   `QueueUnavailable` error instead of a crash

mod broker;
mod jobs;
mod provider;
mod redis_broker;
mod worker;

pub use broker::{JobBroker, MemoryBroker};
pub use jobs::{
    research_active_key, research_cache_key, research_search_hash, ComplianceJob, JobPayload,
    PolicySpec, ResearchJob, ResearchSearch,
};
pub use provider::{JobQueue, QueueProvider};
pub use redis_broker::RedisBroker;
pub use worker::{JobHandler, Worker, WorkerHandle};

use crate::config::{JobSettings, QueueConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for a single retry delay
const MAX_RETRY_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Lease assumed for records stored before leases existed
const DEFAULT_LEASE_MS: u64 = 5 * 60 * 1000;

/// Recorded on a job whose worker stopped reporting before its lease ran out
pub const LEASE_EXPIRED: &str = "job lease expired before the attempt finished";

/// Identity of an independent task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskQueue {
    ComplianceChecks,
    ResearchJobs,
}

impl TaskQueue {
    pub const ALL: [TaskQueue; 2] = [TaskQueue::ComplianceChecks, TaskQueue::ResearchJobs];

    /// Broker-facing queue name
    pub fn name(&self) -> &'static str {
        match self {
            TaskQueue::ComplianceChecks => "compliance-checks",
            TaskQueue::ResearchJobs => "research-jobs",
        }
    }

    /// Settings for this queue from configuration
    pub fn settings<'a>(&self, config: &'a QueueConfig) -> &'a JobSettings {
        match self {
            TaskQueue::ComplianceChecks => &config.compliance,
            TaskQueue::ResearchJobs => &config.research,
        }
    }
}

impl fmt::Display for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Retry and retention policy attached to every submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Duration,
    pub keep_failed: usize,
    pub lease: Duration,
}

impl From<&JobSettings> for JobOptions {
    fn from(settings: &JobSettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            backoff: settings.backoff(),
            keep_failed: settings.keep_failed,
            lease: settings.lease(),
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

/// A job as stored by a broker. The payload stays opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub queue: TaskQueue,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub keep_failed: usize,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// Lease deadline of the current attempt while active
    #[serde(default)]
    pub active_until: Option<DateTime<Utc>>,
}

fn default_lease_ms() -> u64 {
    DEFAULT_LEASE_MS
}

impl JobRecord {
    pub fn new(
        queue: TaskQueue,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            queue,
            payload,
            attempts_made: 0,
            max_attempts: options.attempts,
            backoff_ms: options.backoff.as_millis() as u64,
            keep_failed: options.keep_failed,
            state: JobState::Pending,
            enqueued_at: now,
            available_at: now,
            last_error: None,
            lease_ms: options.lease.as_millis() as u64,
            active_until: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }

    /// Start an attempt: count it, mark the job active and take a lease
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts_made += 1;
        self.state = JobState::Active;
        self.active_until = Some(now + chrono::Duration::milliseconds(self.lease_ms as i64));
    }

    /// Active with a lease that ran out before `now`
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.active_until.is_some_and(|until| until < now)
    }
}

/// Typed view of a claimed job handed to a handler
#[derive(Debug, Clone)]
pub struct Job<P> {
    pub id: Uuid,
    pub name: String,
    pub payload: P,
    /// 1-based attempt number of this run
    pub attempt: u32,
    pub max_attempts: u32,
}

/// What happens to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Retry { available_at: DateTime<Utc> },
    Exhausted,
}

/// Decide the fate of a job whose current attempt failed.
///
/// Attempt `n` (1-based, already counted in `attempts_made`) is retried
/// after `backoff * 2^(n-1)` while attempts remain.
pub fn settle_failure(record: &JobRecord, now: DateTime<Utc>) -> Settlement {
    if record.attempts_made >= record.max_attempts {
        return Settlement::Exhausted;
    }

    let exponent = record.attempts_made.saturating_sub(1).min(20);
    let delay_ms = record
        .backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(MAX_RETRY_DELAY_MS);

    Settlement::Retry {
        available_at: now + chrono::Duration::milliseconds(delay_ms as i64),
    }
}

/// Per-queue job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub failed: usize,
}

/// How a close call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Drained within the timeout
    Graceful,
    /// Timeout hit, remaining work abandoned
    Forced,
}
