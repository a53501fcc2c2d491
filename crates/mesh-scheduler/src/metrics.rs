//! Prometheus metrics for scheduling decisions and the sample pipeline

use crate::{Result, SchedulerError};
use mesh_core::LatencyReport;
use mesh_predict::{BufferStats, UploaderStats};
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Metrics owned by the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    registry: Registry,

    /// Decisions by profile and outcome
    pub decisions: CounterVec,

    /// Decision latency by profile
    pub decision_latency: HistogramVec,

    /// Candidates excluded for lack of a forecast
    pub forecast_failures: IntCounter,

    /// Decisions that fell back to the baseline profile
    pub baseline_fallbacks: IntCounter,

    /// Requests shed
    pub sheds: IntCounter,

    /// Absolute TTFT prediction error
    pub ttft_prediction_error: Histogram,

    /// Mean absolute TPOT prediction error per request
    pub tpot_prediction_error: Histogram,

    /// Sample pipeline counters, refreshed on scrape
    pub samples: IntGaugeVec,
}

impl SchedulerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            decisions: CounterVec::new(
                Opts::new("slo_mesh_decisions_total", "Scheduling decisions"),
                &["profile", "outcome"],
            )?,
            decision_latency: HistogramVec::new(
                HistogramOpts::new(
                    "slo_mesh_decision_latency_seconds",
                    "Scheduling decision latency in seconds",
                )
                .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
                &["profile"],
            )?,
            forecast_failures: IntCounter::new(
                "slo_mesh_forecast_failures_total",
                "Candidates excluded because their forecast was unavailable",
            )?,
            baseline_fallbacks: IntCounter::new(
                "slo_mesh_baseline_fallbacks_total",
                "Predictive decisions that fell back to the baseline profile",
            )?,
            sheds: IntCounter::new("slo_mesh_sheds_total", "Requests shed by the SLO scorer")?,
            ttft_prediction_error: Histogram::with_opts(
                HistogramOpts::new(
                    "slo_mesh_ttft_prediction_error_ms",
                    "Absolute TTFT prediction error in milliseconds",
                )
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0]),
            )?,
            tpot_prediction_error: Histogram::with_opts(
                HistogramOpts::new(
                    "slo_mesh_tpot_prediction_error_ms",
                    "Mean absolute TPOT prediction error in milliseconds",
                )
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0]),
            )?,
            samples: IntGaugeVec::new(
                Opts::new("slo_mesh_samples", "Latency sample pipeline counters"),
                &["state"],
            )?,
        };
        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> prometheus::Result<()> {
        self.registry.register(Box::new(self.decisions.clone()))?;
        self.registry.register(Box::new(self.decision_latency.clone()))?;
        self.registry.register(Box::new(self.forecast_failures.clone()))?;
        self.registry.register(Box::new(self.baseline_fallbacks.clone()))?;
        self.registry.register(Box::new(self.sheds.clone()))?;
        self.registry.register(Box::new(self.ttft_prediction_error.clone()))?;
        self.registry.register(Box::new(self.tpot_prediction_error.clone()))?;
        self.registry.register(Box::new(self.samples.clone()))?;
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_decision(&self, profile: &str, outcome: &str, elapsed: Duration) {
        self.decisions.with_label_values(&[profile, outcome]).inc();
        self.decision_latency
            .with_label_values(&[profile])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_forecast_failures(&self, count: usize) {
        self.forecast_failures.inc_by(count as u64);
    }

    /// Prediction accuracy of a finished request
    pub fn observe_report(&self, report: &LatencyReport) {
        if let Some(error) = report.ttft_error_ms() {
            self.ttft_prediction_error.observe(error);
        }
        if let Some(error) = report.mean_tpot_error_ms() {
            self.tpot_prediction_error.observe(error);
        }
    }

    pub fn refresh_samples(&self, buffer: BufferStats, uploader: &UploaderStats) {
        let set = |state: &str, value: u64| {
            self.samples.with_label_values(&[state]).set(value as i64);
        };
        set("enqueued", buffer.enqueued);
        set("evicted", buffer.evicted);
        set("buffered", buffer.len as u64);
        set("uploaded", uploader.uploaded_samples.load(Ordering::Relaxed));
        set("failed_uploads", uploader.failed_flushes.load(Ordering::Relaxed));
    }

    /// Text exposition of every registered metric
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SchedulerError::Metrics(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| SchedulerError::Metrics(format!("Metrics are not UTF-8: {}", e)))
    }
}
