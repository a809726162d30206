//! Prometheus metrics registry for the sync service.
//!
//! [`AppMetrics`] owns every registered metric and the [`Registry`] they
//! belong to. Construct it once at startup, wrap it in `Arc`, and hand it to
//! the orchestrator, the aggregation engine and the HTTP layer.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry,
};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Sync passes that actually ran (single-flight no-ops are not counted).
    pub sync_passes_total: Counter,
    /// Sub-sync failures, labelled by error kind.
    pub sync_errors_total: CounterVec,
    /// Wall time of a full sync pass in seconds.
    pub sync_duration: Histogram,
    /// Raw rows written by the ingestion pipeline.
    pub ingested_points_total: IntCounter,
    /// Entities currently held by the hot cache.
    pub cache_entities: Gauge,
    /// Aggregations answered from the memo without recomputing.
    pub memo_hits_total: IntCounter,
    /// HTTP request count, labelled by method, path, and status code.
    pub http_requests_total: CounterVec,
    /// HTTP request latency histogram in seconds.
    pub http_request_duration: Histogram,
    pub registry: Registry,
}

impl AppMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sync_passes_total = Counter::with_opts(Opts::new(
            "anomaly_sync_passes_total",
            "Completed synchronization passes",
        ))?;

        let sync_errors_total = CounterVec::new(
            Opts::new(
                "anomaly_sync_errors_total",
                "Failed sub-syncs by error kind",
            ),
            &["kind"],
        )?;

        let sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "anomaly_sync_pass_duration_seconds",
                "Duration of a synchronization pass in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;

        let ingested_points_total = IntCounter::with_opts(Opts::new(
            "anomaly_sync_ingested_points_total",
            "Raw data points written to the local store",
        ))?;

        let cache_entities = Gauge::with_opts(Opts::new(
            "anomaly_sync_cache_entities",
            "Entities held by the hot cache",
        ))?;

        let memo_hits_total = IntCounter::with_opts(Opts::new(
            "anomaly_sync_memo_hits_total",
            "Aggregations served from the memo",
        ))?;

        let http_requests_total = CounterVec::new(
            Opts::new(
                "anomaly_sync_http_requests_total",
                "HTTP requests by method, path, and status",
            ),
            &["method", "path", "status"],
        )?;

        let http_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "anomaly_sync_http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        registry.register(Box::new(sync_passes_total.clone()))?;
        registry.register(Box::new(sync_errors_total.clone()))?;
        registry.register(Box::new(sync_duration.clone()))?;
        registry.register(Box::new(ingested_points_total.clone()))?;
        registry.register(Box::new(cache_entities.clone()))?;
        registry.register(Box::new(memo_hits_total.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            sync_passes_total,
            sync_errors_total,
            sync_duration,
            ingested_points_total,
            cache_entities,
            memo_hits_total,
            http_requests_total,
            http_request_duration,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_without_error() {
        let metrics = AppMetrics::new();
        assert!(metrics.is_ok(), "AppMetrics::new() failed: {:?}", metrics.err());
    }

    #[test]
    fn render_contains_every_family_after_use() {
        let metrics = AppMetrics::new().unwrap();
        metrics.sync_passes_total.inc();
        metrics.sync_errors_total.with_label_values(&["connectivity"]).inc();
        metrics.sync_duration.observe(1.2);
        metrics.ingested_points_total.inc_by(24);
        metrics.cache_entities.set(3.0);
        metrics.memo_hits_total.inc();
        metrics
            .http_requests_total
            .with_label_values(&["GET", "/api/metrics", "200"])
            .inc();
        metrics.http_request_duration.observe(0.01);

        let output = metrics.render().unwrap();

        for name in [
            "anomaly_sync_passes_total",
            "anomaly_sync_errors_total",
            "anomaly_sync_pass_duration_seconds",
            "anomaly_sync_ingested_points_total 24",
            "anomaly_sync_cache_entities 3",
            "anomaly_sync_memo_hits_total 1",
            "anomaly_sync_http_requests_total",
            "anomaly_sync_http_request_duration_seconds",
        ] {
            assert!(output.contains(name), "missing {name}");
        }
    }

    #[test]
    fn error_counter_is_split_by_kind() {
        let metrics = AppMetrics::new().unwrap();
        metrics.sync_errors_total.with_label_values(&["connectivity"]).inc_by(2.0);
        metrics.sync_errors_total.with_label_values(&["storage_full"]).inc();

        let connectivity = metrics
            .sync_errors_total
            .with_label_values(&["connectivity"])
            .get();
        let full = metrics
            .sync_errors_total
            .with_label_values(&["storage_full"])
            .get();
        assert!((connectivity - 2.0).abs() < f64::EPSILON);
        assert!((full - 1.0).abs() < f64::EPSILON);
    }
}
