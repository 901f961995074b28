//! Metrics and observability utilities
//!
//! Metric descriptions and record helpers on the metrics-rs facade.
//! No exporter is installed here; the embedding application picks one.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all kbforge metrics
pub const METRICS_PREFIX: &str = "kbforge";

/// Buckets for knowledge base fan-out latency (in seconds)
pub const KB_LATENCY_BUCKETS: &[f64] = &[
    0.010,  // 10ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    15.00,  // 15s - default backend deadline
];

/// Buckets for embedding latency (typically slower)
pub const EMBEDDING_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Chunking metrics
    describe_counter!(
        format!("{}_chunks_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total chunks produced by the chunker"
    );

    // Index metrics
    describe_counter!(
        format!("{}_index_inserts_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks accepted by the vector store"
    );

    describe_counter!(
        format!("{}_index_rejects_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks rejected by the vector store for lacking an embedding"
    );

    describe_gauge!(
        format!("{}_index_nodes", METRICS_PREFIX),
        Unit::Count,
        "Number of chunks held by the vector store"
    );

    // Knowledge base metrics
    describe_counter!(
        format!("{}_kb_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total knowledge base queries issued"
    );

    describe_counter!(
        format!("{}_kb_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Knowledge base queries that failed or timed out"
    );

    describe_histogram!(
        format!("{}_kb_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Knowledge base query latency in seconds"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API errors"
    );

    // Queue metrics
    describe_counter!(
        format!("{}_jobs_submitted_total", METRICS_PREFIX),
        Unit::Count,
        "Jobs accepted by a task queue"
    );

    describe_counter!(
        format!("{}_jobs_completed_total", METRICS_PREFIX),
        Unit::Count,
        "Jobs whose handler succeeded"
    );

    describe_counter!(
        format!("{}_jobs_retried_total", METRICS_PREFIX),
        Unit::Count,
        "Failed attempts rescheduled with backoff"
    );

    describe_counter!(
        format!("{}_jobs_failed_total", METRICS_PREFIX),
        Unit::Count,
        "Jobs that exhausted their attempts"
    );

    describe_counter!(
        format!("{}_queue_unavailable_total", METRICS_PREFIX),
        Unit::Count,
        "Queue requests answered with unavailable"
    );

    tracing::info!("Metrics registered");
}

/// Tracks one knowledge base query from start to settle
pub struct KbQueryTimer {
    start: Instant,
    knowledge_base: String,
}

impl KbQueryTimer {
    pub fn start(knowledge_base: &str) -> Self {
        counter!(
            format!("{}_kb_queries_total", METRICS_PREFIX),
            "knowledge_base" => knowledge_base.to_string()
        )
        .increment(1);

        Self {
            start: Instant::now(),
            knowledge_base: knowledge_base.to_string(),
        }
    }

    /// Record the outcome of the query
    pub fn finish(self, success: bool) {
        histogram!(
            format!("{}_kb_duration_seconds", METRICS_PREFIX),
            "knowledge_base" => self.knowledge_base.clone()
        )
        .record(self.start.elapsed().as_secs_f64());

        if !success {
            counter!(
                format!("{}_kb_failures_total", METRICS_PREFIX),
                "knowledge_base" => self.knowledge_base
            )
            .increment(1);
        }
    }
}

/// Helper to record chunking metrics
pub fn record_chunks(source: &str, count: usize) {
    counter!(
        format!("{}_chunks_created_total", METRICS_PREFIX),
        "source" => source.to_string()
    )
    .increment(count as u64);
}

/// Helper to record a vector store insert attempt
pub fn record_index_insert(accepted: bool, total_nodes: usize) {
    if accepted {
        counter!(format!("{}_index_inserts_total", METRICS_PREFIX)).increment(1);
    } else {
        counter!(format!("{}_index_rejects_total", METRICS_PREFIX)).increment(1);
    }
    gauge!(format!("{}_index_nodes", METRICS_PREFIX)).set(total_nodes as f64);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
        tracing::trace!(model, batch_size, duration_secs, "Embedding batch recorded");
    } else {
        counter!(
            format!("{}_embedding_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }
}

/// Lifecycle events a job goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Submitted,
    Completed,
    Retried,
    Failed,
}

/// Helper to record job lifecycle metrics
pub fn record_job(queue: &str, event: JobEvent) {
    let name = match event {
        JobEvent::Submitted => "jobs_submitted_total",
        JobEvent::Completed => "jobs_completed_total",
        JobEvent::Retried => "jobs_retried_total",
        JobEvent::Failed => "jobs_failed_total",
    };

    counter!(
        format!("{}_{}", METRICS_PREFIX, name),
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Helper to record an unavailable queue answer
pub fn record_queue_unavailable(queue: &str) {
    counter!(
        format!("{}_queue_unavailable_total", METRICS_PREFIX),
        "queue" => queue.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [KB_LATENCY_BUCKETS, EMBEDDING_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
        // Default backend deadline should be a bucket boundary
        assert!(KB_LATENCY_BUCKETS.contains(&15.0));
    }

    #[test]
    fn test_recorders_without_exporter() {
        register_metrics();
        let timer = KbQueryTimer::start("kb-1");
        timer.finish(false);
        record_chunks("body", 3);
        record_index_insert(false, 0);
        record_job("compliance-checks", JobEvent::Retried);
        record_queue_unavailable("research-jobs");
        // No recorder installed: every call is a no-op and must not panic
    }
}
