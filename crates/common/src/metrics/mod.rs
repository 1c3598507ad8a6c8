//! Metrics and observability utilities
//!
//! Prometheus metrics with SLO-aligned histograms and a shared naming
//! prefix. Recording is a no-op until an exporter is installed.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Cevra metrics
pub const METRICS_PREFIX: &str = "cevra";

/// Histogram buckets for request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Buckets for model calls and ingestion runs (typically slower)
pub const UPSTREAM_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 1m
    120.0, // 2m
];

fn name(suffix: &str) -> String {
    format!("{}_{}", METRICS_PREFIX, suffix)
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(name("requests_total"), Unit::Count, "Total number of HTTP requests");
    describe_histogram!(
        name("request_duration_seconds"),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(name("search_queries_total"), Unit::Count, "Total retrieval queries");
    describe_histogram!(
        name("search_duration_seconds"),
        Unit::Seconds,
        "Retrieval latency in seconds"
    );
    describe_histogram!(
        name("search_results"),
        Unit::Count,
        "Number of passages returned per query"
    );

    describe_counter!(name("items_ingested_total"), Unit::Count, "Ingestion runs by outcome");
    describe_counter!(name("chunks_created_total"), Unit::Count, "Total chunks indexed");
    describe_histogram!(
        name("ingestion_duration_seconds"),
        Unit::Seconds,
        "Ingestion latency in seconds"
    );

    describe_counter!(
        name("embedding_requests_total"),
        Unit::Count,
        "Total embedding API requests"
    );
    describe_histogram!(
        name("embedding_duration_seconds"),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(name("llm_requests_total"), Unit::Count, "Total chat model requests");
    describe_histogram!(
        name("llm_duration_seconds"),
        Unit::Seconds,
        "Chat model latency in seconds"
    );

    describe_counter!(name("agent_turns_total"), Unit::Count, "Agent turns by mode and outcome");
    describe_histogram!(
        name("agent_turn_duration_seconds"),
        Unit::Seconds,
        "Agent turn latency in seconds"
    );
    describe_counter!(name("agent_tool_calls_total"), Unit::Count, "Tool invocations");
    describe_counter!(
        name("agent_summaries_total"),
        Unit::Count,
        "Conversation summarizations"
    );

    describe_counter!(
        name("rate_limited_total"),
        Unit::Count,
        "Requests rejected by the rate limiter"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            name("requests_total"),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            name("request_duration_seconds"),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record one retrieval query
pub fn record_search(duration_secs: f64, result_count: usize) {
    counter!(name("search_queries_total")).increment(1);
    histogram!(name("search_duration_seconds")).record(duration_secs);
    histogram!(name("search_results")).record(result_count as f64);
}

/// Record one embedding API call
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    counter!(
        name("embedding_requests_total"),
        "model" => model.to_string(),
        "status" => outcome(success)
    )
    .increment(1);

    if success {
        histogram!(
            name("embedding_duration_seconds"),
            "model" => model.to_string()
        )
        .record(duration_secs);
        tracing::trace!(model, batch_size, duration_secs, "Embedding batch done");
    }
}

/// Record one chat model call
pub fn record_llm(duration_secs: f64, model: &str, success: bool) {
    counter!(
        name("llm_requests_total"),
        "model" => model.to_string(),
        "status" => outcome(success)
    )
    .increment(1);

    histogram!(name("llm_duration_seconds"), "model" => model.to_string()).record(duration_secs);
}

/// Record the end of an ingestion run
pub fn record_ingestion(duration_secs: f64, chunks_created: usize, status: &str) {
    counter!(name("items_ingested_total"), "status" => status.to_string()).increment(1);
    counter!(name("chunks_created_total")).increment(chunks_created as u64);
    histogram!(name("ingestion_duration_seconds")).record(duration_secs);
}

/// Record one agent turn. `mode` is `respond` or `stream`.
pub fn record_agent_turn(duration_secs: f64, mode: &'static str, status: &'static str) {
    counter!(name("agent_turns_total"), "mode" => mode, "status" => status).increment(1);
    histogram!(name("agent_turn_duration_seconds"), "mode" => mode).record(duration_secs);
}

pub fn record_tool_call(tool: &str) {
    counter!(name("agent_tool_calls_total"), "tool" => tool.to_string()).increment(1);
}

pub fn record_summary() {
    counter!(name("agent_summaries_total")).increment(1);
}

pub fn record_rate_limited(class: &'static str) {
    counter!(name("rate_limited_total"), "class" => class).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_are_sorted() {
        for buckets in [LATENCY_BUCKETS, UPSTREAM_BUCKETS] {
            assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_recording_without_exporter() {
        let metrics = RequestMetrics::start("GET", "/v1/storages");
        metrics.finish(200);
        record_search(0.01, 3);
        record_agent_turn(0.2, "respond", "success");
        assert_eq!(name("requests_total"), "cevra_requests_total");
    }
}
