//! Redis-backed job broker
//!
//! Key layout per queue (`{prefix}:{queue}:...`):
//! - `job:{id}`  job record as JSON
//! - `wait`      list of due job ids (LPUSH in, RPOP out)
//! - `delayed`   sorted set of job ids scored by availability (ms)
//! - `active`    sorted set of claimed job ids scored by lease deadline (ms)
//! - `failed`    list of exhausted job ids, newest first
//!
//! Every move out of `wait` or `active` runs as one script, so a job id is
//! always in exactly one of the lanes.

use super::{JobBroker, JobCounts, JobRecord, JobState, TaskQueue, LEASE_EXPIRED};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Lease held between popping an id and storing its claimed record
const CLAIM_GRACE_MS: i64 = 60_000;

/// KEYS: wait, active. ARGV: provisional lease deadline
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if id then
  redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
"#;

/// KEYS: active, job, delayed. ARGV: id, record, availability
const RETRY_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

/// KEYS: active, job, failed. ARGV: id, record
const BURY_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[1])
return 1
"#;

/// KEYS: active, job. ARGV: id
const COMPLETE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('DEL', KEYS[2])
return 1
"#;

struct Scripts {
    claim: Script,
    retry: Script,
    bury: Script,
    complete: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            bury: Script::new(BURY_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
        }
    }
}

/// Broker storing jobs in Redis over one multiplexed connection
pub struct RedisBroker {
    connection: MultiplexedConnection,
    key_prefix: String,
    scripts: Scripts,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Connect, giving up after `timeout`
    pub async fn connect(url: &str, key_prefix: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::QueueError {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| AppError::QueueError {
                message: format!("Timed out connecting to Redis after {}ms", timeout.as_millis()),
            })?
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        debug!(prefix = key_prefix, "Connected to Redis job broker");

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            scripts: Scripts::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn key(&self, queue: TaskQueue, suffix: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, queue.name(), suffix)
    }

    fn job_key(&self, queue: TaskQueue, id: &str) -> String {
        self.key(queue, &format!("job:{}", id))
    }

    fn conn(&self) -> Result<MultiplexedConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::QueueError {
                message: "broker is closed".to_string(),
            });
        }
        Ok(self.connection.clone())
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        queue: TaskQueue,
        id: &str,
    ) -> Result<Option<JobRecord>> {
        let raw: Option<String> = conn.get(self.job_key(queue, id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => {
                warn!(queue = %queue, job_id = id, "Job id without a stored record");
                Ok(None)
            }
        }
    }

    /// Move an active job to `delayed`. False when it was no longer active.
    async fn move_to_delayed(
        &self,
        conn: &mut MultiplexedConnection,
        mut record: JobRecord,
        available_at: DateTime<Utc>,
    ) -> Result<bool> {
        record.state = JobState::Pending;
        record.available_at = available_at;
        record.active_until = None;

        let queue = record.queue;
        let id = record.id.to_string();
        let moved: i64 = self
            .scripts
            .retry
            .key(self.key(queue, "active"))
            .key(self.job_key(queue, &id))
            .key(self.key(queue, "delayed"))
            .arg(&id)
            .arg(serde_json::to_string(&record)?)
            .arg(millis(available_at))
            .invoke_async(conn)
            .await?;
        Ok(moved == 1)
    }

    /// Move an active job to `failed` and trim the list. False when it was
    /// no longer active.
    async fn move_to_failed(&self, conn: &mut MultiplexedConnection, mut record: JobRecord) -> Result<bool> {
        record.state = JobState::Failed;
        record.active_until = None;

        let queue = record.queue;
        let failed_key = self.key(queue, "failed");
        let id = record.id.to_string();
        let moved: i64 = self
            .scripts
            .bury
            .key(self.key(queue, "active"))
            .key(self.job_key(queue, &id))
            .key(&failed_key)
            .arg(&id)
            .arg(serde_json::to_string(&record)?)
            .invoke_async(conn)
            .await?;
        if moved == 0 {
            return Ok(false);
        }

        let keep = record.keep_failed;
        let trimmed: Vec<String> = conn.lrange(&failed_key, keep as isize, -1).await?;
        if trimmed.is_empty() {
            return Ok(true);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        if keep == 0 {
            pipe.del(&failed_key);
        } else {
            pipe.ltrim(&failed_key, 0, keep as isize - 1);
        }
        for old in &trimmed {
            pipe.del(self.job_key(queue, old));
        }
        let _: () = pipe.query_async(conn).await?;

        debug!(queue = %queue, dropped = trimmed.len(), "Trimmed failed jobs");
        Ok(true)
    }

    /// Settle every job whose lease deadline passed as a failed attempt
    async fn reclaim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        queue: TaskQueue,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let active_key = self.key(queue, "active");
        let expired: Vec<String> = conn
            .zrangebyscore(&active_key, "-inf", format!("({}", millis(now)))
            .await?;

        for id in expired {
            let Some(record) = self.load(conn, queue, &id).await? else {
                let _: i64 = conn.zrem(&active_key, &id).await?;
                continue;
            };
            warn!(queue = %queue, job_id = %id, attempt = record.attempts_made, "Job lease expired, reclaiming");
            // Settling only moves ids that are still active
            self.abandon(record, LEASE_EXPIRED, now).await?;
        }
        Ok(())
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn enqueue(&self, mut record: JobRecord) -> Result<()> {
        record.state = JobState::Pending;
        let mut conn = self.conn()?;
        let json = serde_json::to_string(&record)?;
        let id = record.id.to_string();

        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(record.queue, &id), json)
            .lpush(self.key(record.queue, "wait"), &id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim(&self, queue: TaskQueue, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let mut conn = self.conn()?;
        let delayed_key = self.key(queue, "delayed");
        let wait_key = self.key(queue, "wait");
        let active_key = self.key(queue, "active");

        self.reclaim_expired(&mut conn, queue, now).await?;

        let due: Vec<String> = conn.zrangebyscore(&delayed_key, "-inf", millis(now)).await?;
        for id in due {
            // Only the caller that removes the entry promotes it
            let removed: i64 = conn.zrem(&delayed_key, &id).await?;
            if removed == 1 {
                let _: () = conn.rpush(&wait_key, &id).await?;
            }
        }

        let id: Option<String> = self
            .scripts
            .claim
            .key(&wait_key)
            .key(&active_key)
            .arg(millis(now) + CLAIM_GRACE_MS)
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };
        let Some(mut record) = self.load(&mut conn, queue, &id).await? else {
            let _: i64 = conn.zrem(&active_key, &id).await?;
            return Ok(None);
        };

        record.begin_attempt(now);
        let deadline = record.active_until.map(millis).unwrap_or_else(|| millis(now));
        let json = serde_json::to_string(&record)?;

        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(queue, &id), json)
            .zadd(&active_key, &id, deadline)
            .query_async(&mut conn)
            .await?;

        Ok(Some(record))
    }

    async fn complete(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let id = record.id.to_string();

        let removed: i64 = self
            .scripts
            .complete
            .key(self.key(record.queue, "active"))
            .key(self.job_key(record.queue, &id))
            .arg(&id)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            debug!(queue = %record.queue, job_id = %id, "Completed job was no longer active");
        }
        Ok(())
    }

    async fn retry_later(&self, record: JobRecord, available_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let (queue, id) = (record.queue, record.id);
        if !self.move_to_delayed(&mut conn, record, available_at).await? {
            debug!(queue = %queue, job_id = %id, "Retried job was no longer active");
        }
        Ok(())
    }

    async fn bury(&self, record: JobRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let (queue, id) = (record.queue, record.id);
        if !self.move_to_failed(&mut conn, record).await? {
            debug!(queue = %queue, job_id = %id, "Buried job was no longer active");
        }
        Ok(())
    }

    async fn failed_jobs(&self, queue: TaskQueue) -> Result<Vec<JobRecord>> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = conn.lrange(self.key(queue, "failed"), 0, -1).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&mut conn, queue, &id).await? {
                jobs.push(record);
            }
        }
        Ok(jobs)
    }

    async fn counts(&self, queue: TaskQueue) -> Result<JobCounts> {
        let mut conn = self.conn()?;

        let (waiting, delayed, active, failed): (usize, usize, usize, usize) = redis::pipe()
            .llen(self.key(queue, "wait"))
            .zcard(self.key(queue, "delayed"))
            .zcard(self.key(queue, "active"))
            .llen(self.key(queue, "failed"))
            .query_async(&mut conn)
            .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            failed,
        })
    }

    async fn close(&self) -> Result<()> {
        // The multiplexed connection shuts down once the last clone drops
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("key_prefix", &self.key_prefix)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_broker_fails_to_connect() {
        let result = RedisBroker::connect(
            "redis://127.0.0.1:1",
            "kbforge-test",
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(result, Err(AppError::QueueError { .. })));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = RedisBroker::connect("not-a-url", "kbforge-test", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
