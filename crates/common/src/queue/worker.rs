//! Worker runtime for one task queue
//!
//! Polls the broker for due jobs, rate limited with `governor` and bounded
//! by a semaphore, and settles every attempt: completed jobs leave the
//! broker, failed ones are retried with backoff or buried. Jobs still
//! running when a close times out are handed back to the broker.

use super::{settle_failure, Job, JobBroker, JobPayload, JobRecord, Settlement, ShutdownOutcome};
use crate::config::JobSettings;
use crate::errors::{AppError, Result};
use crate::metrics::{self, JobEvent};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ABANDONED_AT_SHUTDOWN: &str = "worker shut down before the job finished";

/// Records of jobs claimed by one worker and not yet settled
#[derive(Clone, Default)]
struct Claimed(Arc<Mutex<HashMap<Uuid, JobRecord>>>);

impl Claimed {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, JobRecord>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, record: &JobRecord) {
        self.lock().insert(record.id, record.clone());
    }

    fn remove(&self, id: &Uuid) {
        self.lock().remove(id);
    }

    fn take_all(&self) -> Vec<JobRecord> {
        self.lock().drain().map(|(_, record)| record).collect()
    }
}

/// Executes jobs of one payload type
#[async_trait]
pub trait JobHandler<P: JobPayload>: Send + Sync + 'static {
    async fn handle(&self, job: &Job<P>) -> anyhow::Result<()>;
}

pub struct Worker<P, H> {
    broker: Arc<dyn JobBroker>,
    handler: Arc<H>,
    settings: JobSettings,
    _payload: PhantomData<fn() -> P>,
}

/// Running worker; dropping it stops claiming and lets in-flight jobs finish
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    timeout: Duration,
    broker: Arc<dyn JobBroker>,
    claimed: Claimed,
}

fn rate_limiter(settings: &JobSettings) -> Result<DefaultDirectRateLimiter> {
    let max = NonZeroU32::new(settings.rate_limit_max)
        .ok_or_else(|| AppError::configuration("rate_limit_max must be positive"))?;
    let period = Duration::from_millis(settings.rate_limit_window_ms) / max.get();
    let quota = Quota::with_period(period)
        .ok_or_else(|| AppError::configuration("rate_limit_window_ms must be positive"))?
        .allow_burst(max);
    Ok(RateLimiter::direct(quota))
}

impl<P: JobPayload, H: JobHandler<P>> Worker<P, H> {
    pub fn new(broker: Arc<dyn JobBroker>, handler: H, settings: JobSettings) -> Self {
        Self {
            broker,
            handler: Arc::new(handler),
            settings,
            _payload: PhantomData,
        }
    }

    /// Spawn the polling loop
    pub fn start(self) -> Result<WorkerHandle> {
        let limiter = rate_limiter(&self.settings)?;
        let timeout = self.settings.shutdown_timeout();
        let (shutdown, receiver) = watch::channel(false);
        let broker = Arc::clone(&self.broker);
        let claimed = Claimed::default();

        info!(
            queue = %P::QUEUE,
            concurrency = self.settings.concurrency,
            "Worker started"
        );
        let task = tokio::spawn(self.run(limiter, receiver, claimed.clone()));

        Ok(WorkerHandle {
            shutdown,
            task,
            timeout,
            broker,
            claimed,
        })
    }

    async fn run(
        self,
        limiter: DefaultDirectRateLimiter,
        mut shutdown: watch::Receiver<bool>,
        claimed: Claimed,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!(queue = %P::QUEUE, error = %e, "Job task aborted");
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            tokio::select! {
                _ = limiter.until_ready() => {}
                _ = shutdown.changed() => break,
            }

            match self.broker.claim(P::QUEUE, Utc::now()).await {
                Ok(Some(record)) => {
                    claimed.insert(&record);
                    let broker = Arc::clone(&self.broker);
                    let handler = Arc::clone(&self.handler);
                    let claimed = claimed.clone();
                    in_flight.spawn(async move {
                        let id = record.id;
                        process::<P, H>(broker, handler, record, permit).await;
                        claimed.remove(&id);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %P::QUEUE, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        debug!(queue = %P::QUEUE, in_flight = in_flight.len(), "Draining worker");
        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!(queue = %P::QUEUE, error = %e, "Job task aborted");
            }
        }
        info!(queue = %P::QUEUE, "Worker stopped");
    }
}

async fn process<P, H>(
    broker: Arc<dyn JobBroker>,
    handler: Arc<H>,
    mut record: JobRecord,
    _permit: OwnedSemaphorePermit,
) where
    P: JobPayload,
    H: JobHandler<P>,
{
    let queue = P::QUEUE;

    let payload = match serde_json::from_value::<P>(record.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            // A payload that does not decode fails the same way on every attempt
            error!(queue = %queue, job_id = %record.id, error = %e, "Undecodable job payload");
            record.last_error = Some(format!("undecodable payload: {}", e));
            if let Err(e) = broker.bury(record).await {
                error!(queue = %queue, error = %e, "Failed to bury job");
            }
            metrics::record_job(queue.name(), JobEvent::Failed);
            return;
        }
    };

    let job = Job {
        id: record.id,
        name: record.name.clone(),
        payload,
        attempt: record.attempts_made,
        max_attempts: record.max_attempts,
    };

    let outcome = match AssertUnwindSafe(handler.handle(&job)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow::anyhow!("job handler panicked")),
    };

    let settled = match outcome {
        Ok(()) => {
            info!(queue = %queue, job_id = %job.id, attempt = job.attempt, "Job completed");
            metrics::record_job(queue.name(), JobEvent::Completed);
            broker.complete(&record).await
        }
        Err(e) => {
            record.last_error = Some(format!("{:#}", e));
            match settle_failure(&record, Utc::now()) {
                Settlement::Retry { available_at } => {
                    warn!(
                        queue = %queue,
                        job_id = %job.id,
                        attempt = job.attempt,
                        max_attempts = job.max_attempts,
                        retry_at = %available_at,
                        error = %e,
                        "Job failed, scheduling retry"
                    );
                    metrics::record_job(queue.name(), JobEvent::Retried);
                    broker.retry_later(record, available_at).await
                }
                Settlement::Exhausted => {
                    error!(
                        queue = %queue,
                        job_id = %job.id,
                        attempts = job.attempt,
                        error = %e,
                        "Job failed permanently"
                    );
                    metrics::record_job(queue.name(), JobEvent::Failed);
                    broker.bury(record).await
                }
            }
        }
    };

    if let Err(e) = settled {
        error!(queue = %queue, job_id = %job.id, error = %e, "Failed to settle job");
    }
}

impl WorkerHandle {
    /// Stop claiming, wait for in-flight jobs, abort after the shutdown
    /// timeout and return the unfinished jobs to the queue
    pub async fn close(mut self) -> ShutdownOutcome {
        let _ = self.shutdown.send(true);

        match tokio::time::timeout(self.timeout, &mut self.task).await {
            Ok(_) => ShutdownOutcome::Graceful,
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Worker did not drain in time, aborting"
                );
                self.task.abort();
                let _ = (&mut self.task).await;
                self.release_abandoned().await;
                ShutdownOutcome::Forced
            }
        }
    }

    /// Put aborted jobs back as due without spending their attempt
    async fn release_abandoned(&self) {
        for mut record in self.claimed.take_all() {
            let (queue, id) = (record.queue, record.id);
            record.attempts_made = record.attempts_made.saturating_sub(1);
            record.last_error = Some(ABANDONED_AT_SHUTDOWN.to_string());

            match self.broker.retry_later(record, Utc::now()).await {
                Ok(()) => warn!(queue = %queue, job_id = %id, "Requeued job abandoned at shutdown"),
                Err(e) => {
                    error!(queue = %queue, job_id = %id, error = %e, "Failed to requeue abandoned job")
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
