// Prometheus metrics for the stagerun worker

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Jobs finished, labelled by outcome (success, failure, or the error kind)
    pub static ref JOBS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("stagerun_jobs_total", "Total number of jobs processed"),
        &["outcome"]
    )
    .expect("metric can be created");

    // Wall time of one orchestrator run (seconds)
    pub static ref JOB_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "stagerun_job_duration_seconds",
            "Job duration from claim to cleanup"
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )
    .expect("metric can be created");

    // Jobs currently executing on this worker
    pub static ref JOBS_IN_FLIGHT: IntGauge = IntGauge::new(
        "stagerun_jobs_in_flight",
        "Jobs currently being processed"
    )
    .expect("metric can be created");

    // Viewer streams currently attached
    pub static ref VIEWERS_ATTACHED: IntGauge = IntGauge::new(
        "stagerun_viewers_attached",
        "Live log viewers currently attached"
    )
    .expect("metric can be created");
}

/// Initialize metrics registry
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(JOBS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOB_DURATION.clone()))?;
    REGISTRY.register(Box::new(JOBS_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(VIEWERS_ATTACHED.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a finished job
pub fn record_job_finished(outcome: &str, duration_secs: f64) {
    JOBS_TOTAL.with_label_values(&[outcome]).inc();
    JOB_DURATION.observe(duration_secs);
}
