//! Prometheus metrics for the asset gateway
//!
//! Every [`GateMetrics`] owns its own registry so several servers can live in
//! one process (tests build many).

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

pub struct GateMetrics {
    registry: Registry,
    requests_total: CounterVec,
    cache_results_total: CounterVec,
    work_queue_total: CounterVec,
    errors_total: CounterVec,
    transform_duration_seconds: HistogramVec,
    invalidations_total: CounterVec,
}

impl GateMetrics {
    /// Create the collectors and register them with a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("assetgate_requests_total", "Total asset requests by handler kind"),
            &["kind"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let cache_results_total = CounterVec::new(
            Opts::new("assetgate_cache_results_total", "Cache lookups by result"),
            &["result"],
        )?;
        registry.register(Box::new(cache_results_total.clone()))?;

        let work_queue_total = CounterVec::new(
            Opts::new(
                "assetgate_work_queue_total",
                "Production jobs by outcome: new jobs and requests coalesced onto one in flight",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(work_queue_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("assetgate_errors_total", "Error responses by HTTP status"),
            &["status"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let transform_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assetgate_transform_duration_seconds",
                "Origin fetch plus transform time in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["kind"],
        )?;
        registry.register(Box::new(transform_duration_seconds.clone()))?;

        let invalidations_total = CounterVec::new(
            Opts::new("assetgate_invalidations_total", "Cache invalidations by method"),
            &["method"],
        )?;
        registry.register(Box::new(invalidations_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            cache_results_total,
            work_queue_total,
            errors_total,
            transform_duration_seconds,
            invalidations_total,
        })
    }

    pub fn record_request(&self, kind: &str) {
        self.requests_total.with_label_values(&[kind]).inc();
    }

    /// Record a cache lookup
    ///
    /// # Arguments
    /// * `hit` - Whether a live entry was found
    pub fn record_cache(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_results_total.with_label_values(&[result]).inc();
    }

    pub fn record_job(&self, outcome: &str) {
        self.work_queue_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_error(&self, status: u16) {
        self.errors_total
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    pub fn record_transform(&self, kind: &str, elapsed: Duration) {
        self.transform_duration_seconds
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    /// # Arguments
    /// * `method` - `all` for a full reset, `pattern` for a glob invalidation
    pub fn record_invalidation(&self, method: &str) {
        self.invalidations_total.with_label_values(&[method]).inc();
    }

    /// Render every collector in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
