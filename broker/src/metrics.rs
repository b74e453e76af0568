//! Prometheus metrics for the broker.
//!
//! [`BrokerMetrics`] owns a dedicated [`Registry`] that `GET /metrics`
//! encodes into the Prometheus text exposition format.

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::buckets::{Bucket, BucketCounts};

pub struct BrokerMetrics {
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Dispatch calls that reached the worker pool.
    pub dispatches: IntCounter,
    /// Dispatches widened from one bucket to every bucket.
    pub escalations: IntCounter,
    /// Dispatches that ended without valid work.
    pub timeouts: IntCounter,
    /// Dispatches answered from the cache or the work store.
    pub cache_hits: IntCounter,
    pub valid_results: IntCounter,
    pub invalid_results: IntCounter,
    /// Responses whose request id was no longer pending.
    pub unmatched_responses: IntCounter,
    /// Connections dropped because their outbound queue was full or closed.
    pub dead_peers: IntCounter,
    /// Credit events lost to a full queue.
    pub dropped_credits: IntCounter,
    pub banned_addresses: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    pub connected_workers: IntGaugeVec,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Time from dispatch to valid work, in milliseconds.
    pub dispatch_latency_ms: Histogram,
}

impl BrokerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let dispatches = register_int_counter_with_registry!(
            Opts::new("bpow_dispatches_total", "Work requests sent to the pool"),
            registry
        )?;
        let escalations = register_int_counter_with_registry!(
            Opts::new(
                "bpow_escalations_total",
                "Requests re-broadcast to every bucket"
            ),
            registry
        )?;
        let timeouts = register_int_counter_with_registry!(
            Opts::new("bpow_timeouts_total", "Requests that received no valid work"),
            registry
        )?;
        let cache_hits = register_int_counter_with_registry!(
            Opts::new("bpow_cache_hits_total", "Requests answered without the pool"),
            registry
        )?;
        let valid_results = register_int_counter_with_registry!(
            Opts::new("bpow_valid_results_total", "Accepted worker results"),
            registry
        )?;
        let invalid_results = register_int_counter_with_registry!(
            Opts::new("bpow_invalid_results_total", "Rejected worker results"),
            registry
        )?;
        let unmatched_responses = register_int_counter_with_registry!(
            Opts::new(
                "bpow_unmatched_responses_total",
                "Worker responses for requests no longer pending"
            ),
            registry
        )?;
        let dead_peers = register_int_counter_with_registry!(
            Opts::new("bpow_dead_peers_total", "Connections dropped on send failure"),
            registry
        )?;
        let dropped_credits = register_int_counter_with_registry!(
            Opts::new(
                "bpow_dropped_credits_total",
                "Credit events dropped on a full queue"
            ),
            registry
        )?;
        let banned_addresses = register_int_counter_with_registry!(
            Opts::new("bpow_banned_addresses_total", "Addresses banned for invalid work"),
            registry
        )?;

        let connected_workers = register_int_gauge_vec_with_registry!(
            Opts::new("bpow_connected_workers", "Connected workers per bucket"),
            &["bucket"],
            registry
        )?;

        // 1 ms → ~32 s.
        let dispatch_latency_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "bpow_dispatch_latency_ms",
                "Dispatch latency in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 16)?),
            registry
        )?;

        Ok(Self {
            registry,
            dispatches,
            escalations,
            timeouts,
            cache_hits,
            valid_results,
            invalid_results,
            unmatched_responses,
            dead_peers,
            dropped_credits,
            banned_addresses,
            connected_workers,
            dispatch_latency_ms,
        })
    }

    pub fn set_bucket_counts(&self, counts: BucketCounts) {
        for (bucket, count) in [
            (Bucket::A, counts.a),
            (Bucket::B, counts.b),
            (Bucket::C, counts.c),
        ] {
            self.connected_workers
                .with_label_values(&[bucket.as_str()])
                .set(count as i64);
        }
    }

    /// Encode every metric in the text exposition format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_contains_registered_metrics() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.dispatches.inc();
        metrics.set_bucket_counts(BucketCounts { a: 2, b: 1, c: 0 });
        let text = metrics.gather().unwrap();
        assert!(text.contains("bpow_dispatches_total 1"));
        assert!(text.contains("bpow_connected_workers{bucket=\"a\"} 2"));
        assert!(text.contains("bpow_dispatch_latency_ms"));
    }

    #[test]
    fn registries_are_independent() {
        let first = BrokerMetrics::new().unwrap();
        let second = BrokerMetrics::new().unwrap();
        first.timeouts.inc();
        assert_eq!(second.timeouts.get(), 0);
    }
}
