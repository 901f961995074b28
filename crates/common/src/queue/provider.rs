//! Injectable queue provider
//!
//! One provider owns the lazily opened broker connection shared by every
//! task queue. Hosts construct it at startup, hand it to request code and
//! close it on shutdown.

use super::{
    JobBroker, JobCounts, JobHandler, JobOptions, JobPayload, JobRecord, RedisBroker,
    ShutdownOutcome, TaskQueue, Worker,
};
use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use crate::metrics::{self, JobEvent};
use chrono::Utc;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

enum BrokerSlot {
    Ready(Arc<dyn JobBroker>),
    Unavailable(String),
}

fn unavailable(queue: TaskQueue, reason: impl Into<String>) -> AppError {
    metrics::record_queue_unavailable(queue.name());
    AppError::QueueUnavailable {
        queue: queue.name().to_string(),
        reason: reason.into(),
    }
}

/// Factory for typed job queues over one shared broker
pub struct QueueProvider {
    config: QueueConfig,
    broker: OnceCell<BrokerSlot>,
    closed: Arc<AtomicBool>,
}

impl QueueProvider {
    /// Create a provider. Never fails and never connects; the broker is
    /// opened on first use.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            broker: OnceCell::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a provider over an already constructed broker
    pub fn with_broker(config: QueueConfig, broker: Arc<dyn JobBroker>) -> Self {
        Self {
            config,
            broker: OnceCell::new_with(Some(BrokerSlot::Ready(broker))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn open(&self) -> BrokerSlot {
        let Some(url) = self.config.redis_url.as_deref() else {
            info!("No queue broker configured, background jobs are disabled");
            return BrokerSlot::Unavailable("no broker URL configured".to_string());
        };

        match RedisBroker::connect(url, &self.config.key_prefix, self.config.connect_timeout()).await
        {
            Ok(broker) => {
                info!("Queue broker connected");
                BrokerSlot::Ready(Arc::new(broker))
            }
            Err(e) => {
                warn!(error = %e, "Queue broker unreachable, background jobs are disabled");
                BrokerSlot::Unavailable(e.to_string())
            }
        }
    }

    /// The shared broker, or `QueueUnavailable` for `queue`
    pub async fn broker(&self, queue: TaskQueue) -> Result<Arc<dyn JobBroker>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(unavailable(queue, "queue provider is closed"));
        }

        match self.broker.get_or_init(|| self.open()).await {
            BrokerSlot::Ready(broker) => Ok(Arc::clone(broker)),
            BrokerSlot::Unavailable(reason) => Err(unavailable(queue, reason.clone())),
        }
    }

    /// Handle for the queue of payload type `P`
    pub async fn queue<P: JobPayload>(&self) -> Result<JobQueue<P>> {
        let broker = self.broker(P::QUEUE).await?;
        Ok(JobQueue {
            broker,
            options: JobOptions::from(P::QUEUE.settings(&self.config)),
            closed: Arc::clone(&self.closed),
            _payload: PhantomData,
        })
    }

    /// Submit one job, resolving the queue on the way
    pub async fn submit<P: JobPayload>(&self, name: &str, payload: P) -> Result<Uuid> {
        self.queue::<P>().await?.submit(name, payload).await
    }

    /// Worker for payload type `P` using this queue's settings
    pub async fn worker<P, H>(&self, handler: H) -> Result<Worker<P, H>>
    where
        P: JobPayload,
        H: JobHandler<P>,
    {
        let broker = self.broker(P::QUEUE).await?;
        Ok(Worker::new(
            broker,
            handler,
            P::QUEUE.settings(&self.config).clone(),
        ))
    }

    /// Close the broker within `close_timeout`.
    ///
    /// Every handle reports unavailable afterwards, whatever the outcome.
    pub async fn close(&self) -> ShutdownOutcome {
        if self.closed.swap(true, Ordering::AcqRel) {
            return ShutdownOutcome::Graceful;
        }

        let deadline = tokio::time::Instant::now() + self.config.close_timeout();

        // Waits out a connect already in flight so its broker is closed too
        let slot = self.broker.get_or_init(|| async {
            BrokerSlot::Unavailable("queue provider is closed".to_string())
        });
        let broker = match tokio::time::timeout_at(deadline, slot).await {
            Ok(BrokerSlot::Ready(broker)) => broker,
            Ok(BrokerSlot::Unavailable(_)) => return ShutdownOutcome::Graceful,
            Err(_) => {
                warn!(
                    timeout_ms = self.config.close_timeout_ms,
                    "Queue broker connect still pending at close, forcing shutdown"
                );
                return ShutdownOutcome::Forced;
            }
        };

        match tokio::time::timeout_at(deadline, broker.close()).await {
            Ok(Ok(())) => {
                info!("Queue broker closed");
                ShutdownOutcome::Graceful
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Queue broker close failed, forcing shutdown");
                ShutdownOutcome::Forced
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.close_timeout_ms,
                    "Queue broker close timed out, forcing shutdown"
                );
                ShutdownOutcome::Forced
            }
        }
    }
}

/// Typed submission handle for one task queue
pub struct JobQueue<P> {
    broker: Arc<dyn JobBroker>,
    options: JobOptions,
    closed: Arc<AtomicBool>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: JobPayload> fmt::Debug for JobQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("queue", &P::QUEUE)
            .field("options", &self.options)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<P: JobPayload> JobQueue<P> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(unavailable(P::QUEUE, "queue provider is closed"));
        }
        Ok(())
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Validate and enqueue a job, returning its id
    pub async fn submit(&self, name: &str, payload: P) -> Result<Uuid> {
        self.ensure_open()?;
        payload.validate()?;

        let record = JobRecord::new(
            P::QUEUE,
            name,
            serde_json::to_value(&payload)?,
            &self.options,
            Utc::now(),
        );
        let id = record.id;

        self.broker.enqueue(record).await?;
        metrics::record_job(P::QUEUE.name(), JobEvent::Submitted);
        info!(queue = %P::QUEUE, job_id = %id, name, "Job submitted");

        Ok(id)
    }

    /// Retained failed jobs, newest first
    pub async fn failed_jobs(&self) -> Result<Vec<JobRecord>> {
        self.ensure_open()?;
        self.broker.failed_jobs(P::QUEUE).await
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        self.ensure_open()?;
        self.broker.counts(P::QUEUE).await
    }
}
