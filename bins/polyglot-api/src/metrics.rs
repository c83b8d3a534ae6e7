// Prometheus instruments for the execution service

use lazy_static::lazy_static;
use polyglot_common::types::{FailureKind, Language};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("polyglot_executions_total", "Executions by language and outcome"),
        &["language", "outcome"]
    )
    .expect("static metric definition");
    pub static ref EXECUTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "polyglot_execution_duration_seconds",
            "Wall-clock time of executions by language"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["language"]
    )
    .expect("static metric definition");
    pub static ref RATE_LIMITED_TOTAL: IntCounter = IntCounter::new(
        "polyglot_rate_limited_total",
        "Requests refused by the rate limiter"
    )
    .expect("static metric definition");
    pub static ref ACTIVE_CHANNELS: IntGauge = IntGauge::new(
        "polyglot_active_channels",
        "Open streaming channel connections"
    )
    .expect("static metric definition");
    static ref REGISTRY: Registry = build_registry();
}

fn build_registry() -> Registry {
    let registry = Registry::new();
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EXECUTIONS_TOTAL.clone()),
        Box::new(EXECUTION_DURATION.clone()),
        Box::new(RATE_LIMITED_TOTAL.clone()),
        Box::new(ACTIVE_CHANNELS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            warn!(error = %e, "Failed to register metric");
        }
    }
    registry
}

pub fn init() {
    lazy_static::initialize(&REGISTRY);
}

/// Outcome label: `success` or the failure kind
pub fn outcome_label(failure_kind: Option<FailureKind>) -> String {
    match failure_kind {
        None => "success".to_string(),
        Some(kind) => kind.to_string(),
    }
}

pub fn observe_execution(language: Language, failure_kind: Option<FailureKind>, execution_time_ms: u64) {
    EXECUTIONS_TOTAL
        .with_label_values(&[language.as_str(), &outcome_label(failure_kind)])
        .inc();
    EXECUTION_DURATION
        .with_label_values(&[language.as_str()])
        .observe(execution_time_ms as f64 / 1000.0);
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
