//! Prometheus metrics: checks by outcome, check duration, errors by kind.
//! Recording is a no-op until `init` is called; the binary serves GET /metrics when enabled.

use once_cell::sync::OnceCell;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};

static METRICS: OnceCell<MetricsInner> = OnceCell::new();

struct MetricsInner {
    checks_total: IntCounterVec,
    check_duration_seconds: HistogramVec,
    errors_total: IntCounterVec,
}

/// Initialize metrics and register with the default registry. Call once.
pub fn init() -> Result<(), prometheus::Error> {
    let checks_total = IntCounterVec::new(
        Opts::new(
            "redup_checks_total",
            "Duplicate checks by strategy and outcome (duplicate, unique, error)",
        ),
        &["strategy", "outcome"],
    )?;
    let check_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "redup_check_duration_seconds",
            "Duplicate check duration in seconds, store round trips included",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 14)?),
        &["strategy"],
    )?;
    let errors_total = IntCounterVec::new(
        Opts::new("redup_errors_total", "Failed checks by strategy and error kind"),
        &["strategy", "kind"],
    )?;

    prometheus::register(Box::new(checks_total.clone()))?;
    prometheus::register(Box::new(check_duration_seconds.clone()))?;
    prometheus::register(Box::new(errors_total.clone()))?;

    let _ = METRICS.set(MetricsInner {
        checks_total,
        check_duration_seconds,
        errors_total,
    });
    Ok(())
}

/// Record one completed check. outcome: "duplicate", "unique" or "error".
pub fn record_check(strategy: &str, outcome: &str, duration_secs: f64) {
    if let Some(m) = METRICS.get() {
        m.checks_total
            .with_label_values(&[strategy, outcome])
            .inc();
        m.check_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }
}

/// Record one failed check by error kind.
pub fn record_error(strategy: &str, kind: &str) {
    if let Some(m) = METRICS.get() {
        m.errors_total.with_label_values(&[strategy, kind]).inc();
    }
}

/// Encode all metrics in Prometheus text format. Empty when metrics are not initialized.
pub fn encode() -> String {
    if METRICS.get().is_none() {
        return String::new();
    }
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).into_owned()
    } else {
        String::new()
    }
}
