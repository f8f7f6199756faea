//! Reporter port: a narrow metrics interface the core invokes
//! unconditionally. The reporter may no-op; `PrometheusReporter` is the
//! production implementation, built on a `LazyLock<Registry>` of
//! per-metric statics.

use std::sync::LazyLock;
use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder};

use crate::policy::RunKind;

/// Output port the core calls on every processed Run, every deletion,
/// every error, and every configuration reload.
pub trait Reporter: Send + Sync {
    fn resource_processed(&self, namespace: &str, kind: RunKind, status: &str);
    fn resource_deleted(&self, namespace: &str, kind: RunKind, reason: &str);
    fn resource_error(&self, namespace: &str, kind: RunKind, reason: &str);
    fn reconciliation_duration(&self, namespace: &str, kind: RunKind, duration: Duration);
    fn ttl_processing_duration(&self, namespace: &str, kind: RunKind, duration: Duration);
    fn history_processing_duration(&self, namespace: &str, kind: RunKind, duration: Duration);
    fn resource_age_at_deletion(&self, namespace: &str, kind: RunKind, age: Duration);
    fn configuration_reload(&self, level: &str);
    fn configuration_error(&self, level: &str);
    fn garbage_collection_duration(&self, duration: Duration, namespace_count: usize);
    fn queue_depth(&self, depth: i64);
    fn active_resources(&self, namespace: &str, kind: RunKind, count: i64);
}

/// Does nothing. Used by tests and anywhere metrics wiring is not needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn resource_processed(&self, _namespace: &str, _kind: RunKind, _status: &str) {}
    fn resource_deleted(&self, _namespace: &str, _kind: RunKind, _reason: &str) {}
    fn resource_error(&self, _namespace: &str, _kind: RunKind, _reason: &str) {}
    fn reconciliation_duration(&self, _namespace: &str, _kind: RunKind, _duration: Duration) {}
    fn ttl_processing_duration(&self, _namespace: &str, _kind: RunKind, _duration: Duration) {}
    fn history_processing_duration(&self, _namespace: &str, _kind: RunKind, _duration: Duration) {}
    fn resource_age_at_deletion(&self, _namespace: &str, _kind: RunKind, _age: Duration) {}
    fn configuration_reload(&self, _level: &str) {}
    fn configuration_error(&self, _level: &str) {}
    fn garbage_collection_duration(&self, _duration: Duration, _namespace_count: usize) {}
    fn queue_depth(&self, _depth: i64) {}
    fn active_resources(&self, _namespace: &str, _kind: RunKind, _count: i64) {}
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RESOURCES_PROCESSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("pruner_resources_processed_total", "Runs evaluated by the reconciler or sweeper"),
        &["namespace", "kind", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RESOURCES_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("pruner_resources_deleted_total", "Runs deleted, by reason"),
        &["namespace", "kind", "reason"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RESOURCE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("pruner_resource_errors_total", "Per-Run errors, by reason"),
        &["namespace", "kind", "reason"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new("pruner_reconciliation_duration_seconds", "Event Reconciler call duration"),
        &["namespace", "kind"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static TTL_PROCESSING_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new("pruner_ttl_processing_duration_seconds", "TTL Engine call duration"),
        &["namespace", "kind"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static HISTORY_PROCESSING_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new("pruner_history_processing_duration_seconds", "History Limiter call duration"),
        &["namespace", "kind"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static RESOURCE_AGE_AT_DELETION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new("pruner_resource_age_at_deletion_seconds", "Age of a Run at the moment it was deleted"),
        &["namespace", "kind"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static CONFIG_RELOADS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("pruner_configuration_reload_total", "Successful Policy Store reloads, by level"),
        &["level"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static CONFIG_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("pruner_configuration_error_total", "Policy Store reload failures, by level"),
        &["level"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static GARBAGE_COLLECTION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "pruner_garbage_collection_duration_seconds",
        "Duration of a full Periodic Sweeper pass",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static GARBAGE_COLLECTION_NAMESPACES: LazyLock<prometheus::IntGauge> = LazyLock::new(|| {
    let g = prometheus::IntGauge::new(
        "pruner_garbage_collection_namespaces",
        "Namespace count swept in the most recent Periodic Sweeper pass",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static QUEUE_DEPTH: LazyLock<prometheus::IntGauge> = LazyLock::new(|| {
    let g = prometheus::IntGauge::new("pruner_queue_depth", "Pending reconcile keys in the host's event queue")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static ACTIVE_RESOURCES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("pruner_active_resources", "Runs currently tracked, by namespace and kind"),
        &["namespace", "kind"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/// Force every metric into existence so `/metrics` reports a zero series
/// rather than omitting it before first use.
pub fn init() {
    LazyLock::force(&RESOURCES_PROCESSED);
    LazyLock::force(&RESOURCES_DELETED);
    LazyLock::force(&RESOURCE_ERRORS);
    LazyLock::force(&RECONCILIATION_DURATION);
    LazyLock::force(&TTL_PROCESSING_DURATION);
    LazyLock::force(&HISTORY_PROCESSING_DURATION);
    LazyLock::force(&RESOURCE_AGE_AT_DELETION);
    LazyLock::force(&CONFIG_RELOADS);
    LazyLock::force(&CONFIG_ERRORS);
    LazyLock::force(&GARBAGE_COLLECTION_DURATION);
    LazyLock::force(&GARBAGE_COLLECTION_NAMESPACES);
    LazyLock::force(&QUEUE_DEPTH);
    LazyLock::force(&ACTIVE_RESOURCES);
}

/// Render the registry in the Prometheus text exposition format, for the
/// `/metrics` HTTP handler.
pub fn gather() -> Result<String, prometheus::Error> {
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer).expect("prometheus text output is valid utf-8"))
}

/// `Reporter` backed by the process-wide Prometheus registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusReporter;

impl Reporter for PrometheusReporter {
    fn resource_processed(&self, namespace: &str, kind: RunKind, status: &str) {
        RESOURCES_PROCESSED.with_label_values(&[namespace, kind.as_str(), status]).inc();
    }

    fn resource_deleted(&self, namespace: &str, kind: RunKind, reason: &str) {
        RESOURCES_DELETED.with_label_values(&[namespace, kind.as_str(), reason]).inc();
    }

    fn resource_error(&self, namespace: &str, kind: RunKind, reason: &str) {
        RESOURCE_ERRORS.with_label_values(&[namespace, kind.as_str(), reason]).inc();
    }

    fn reconciliation_duration(&self, namespace: &str, kind: RunKind, duration: Duration) {
        RECONCILIATION_DURATION
            .with_label_values(&[namespace, kind.as_str()])
            .observe(duration.as_secs_f64());
    }

    fn ttl_processing_duration(&self, namespace: &str, kind: RunKind, duration: Duration) {
        TTL_PROCESSING_DURATION
            .with_label_values(&[namespace, kind.as_str()])
            .observe(duration.as_secs_f64());
    }

    fn history_processing_duration(&self, namespace: &str, kind: RunKind, duration: Duration) {
        HISTORY_PROCESSING_DURATION
            .with_label_values(&[namespace, kind.as_str()])
            .observe(duration.as_secs_f64());
    }

    fn resource_age_at_deletion(&self, namespace: &str, kind: RunKind, age: Duration) {
        RESOURCE_AGE_AT_DELETION
            .with_label_values(&[namespace, kind.as_str()])
            .observe(age.as_secs_f64());
    }

    fn configuration_reload(&self, level: &str) {
        CONFIG_RELOADS.with_label_values(&[level]).inc();
    }

    fn configuration_error(&self, level: &str) {
        CONFIG_ERRORS.with_label_values(&[level]).inc();
    }

    fn garbage_collection_duration(&self, duration: Duration, namespace_count: usize) {
        GARBAGE_COLLECTION_DURATION.observe(duration.as_secs_f64());
        GARBAGE_COLLECTION_NAMESPACES.set(namespace_count as i64);
    }

    fn queue_depth(&self, depth: i64) {
        QUEUE_DEPTH.set(depth);
    }

    fn active_resources(&self, namespace: &str, kind: RunKind, count: i64) {
        ACTIVE_RESOURCES.with_label_values(&[namespace, kind.as_str()]).set(count);
    }
}
