use std::sync::LazyLock;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/* ============================= REGISTRY ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// The process-wide metrics registry.
///
/// All tracer and exporter metrics register here once, on first touch.
/// The serve command encodes it at `GET /metrics`.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/* ============================= ACTION METRICS ============================= */

pub static ACTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("actions_total", "Total traced actions by service, type, and status"),
        &["service", "action_type", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ACTION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("action_errors_total", "Total failed actions by service and error type"),
        &["service", "error_type"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ACTION_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "action_duration_seconds",
        "Traced action duration in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/* ============================= EXPORTER METRICS ============================= */

pub static EXPORTER_QUEUE_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("exporter_queue_size", "Records currently queued for export")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static EXPORTER_DROPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("exporter_dropped_total", "Records dropped because the queue was full")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static EXPORTER_BATCH_FLUSHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("exporter_batch_flushes_total", "Completed exporter batch flushes")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static EXPORTER_SQL_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "exporter_sql_failures_total",
        "Batches dropped after exhausting SQL insert retries",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= SAMPLING METRICS ============================= */

pub static SAMPLING_DECISIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("sampling_decisions_total", "Sampling decisions by reason"),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= COMPLIANCE METRICS ============================= */

pub static PII_DETECTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("pii_detections_total", "PII pattern matches by type"),
        &["type"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ERASURE_OPERATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("erasure_operations_total", "GDPR erasure operations performed")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ACCESS_AUDIT_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("access_audit_total", "Audited trace accesses by access type"),
        &["access_type"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= ENCODING ============================= */

/// Render the registry in the Prometheus text exposition format.
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register() {
        LazyLock::force(&ACTIONS_TOTAL);
        LazyLock::force(&ACTION_ERRORS_TOTAL);
        LazyLock::force(&ACTION_DURATION_SECONDS);
        LazyLock::force(&EXPORTER_QUEUE_SIZE);
        LazyLock::force(&EXPORTER_DROPPED_TOTAL);
        LazyLock::force(&EXPORTER_BATCH_FLUSHES_TOTAL);
        LazyLock::force(&EXPORTER_SQL_FAILURES_TOTAL);
        LazyLock::force(&SAMPLING_DECISIONS_TOTAL);
        LazyLock::force(&PII_DETECTIONS_TOTAL);
        LazyLock::force(&ERASURE_OPERATIONS_TOTAL);
        LazyLock::force(&ACCESS_AUDIT_TOTAL);

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();

        for expected in [
            "actions_total",
            "action_errors_total",
            "action_duration_seconds",
            "exporter_queue_size",
            "exporter_dropped_total",
            "exporter_batch_flushes_total",
            "exporter_sql_failures_total",
            "sampling_decisions_total",
            "pii_detections_total",
            "erasure_operations_total",
            "access_audit_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "{expected} should be registered"
            );
        }
    }

    #[test]
    fn test_encode_text_renders() {
        LazyLock::force(&EXPORTER_DROPPED_TOTAL);
        let text = encode_text().expect("encoding succeeds");
        assert!(text.contains("exporter_dropped_total"));
    }
}
