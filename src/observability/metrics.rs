//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `kms_operator_reconciliations_total` - Total reconciliations per resource kind
//! - `kms_operator_reconciliation_errors_total` - Total reconciliation errors per resource kind
//! - `kms_operator_reconcile_duration_seconds` - Duration of reconciliation operations
//! - `kms_operator_push_operations_total` - Remote secret operations issued by the push reconciler
//! - `kms_operator_lease_operations_total` - Lease operations issued by the dynamic reconciler
//! - `kms_operator_secrets_synced` - Number of secrets synced by the last pull reconciliation

use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics are registered into the operator's own registry, not the process
// default, and served from it by the HTTP server.
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_operator_reconciliations_total",
            "Total reconciliations per resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_operator_reconciliation_errors_total",
            "Total reconciliation errors per resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "kms_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILE_DURATION metric - this should never happen")
});

static PUSH_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_operator_push_operations_total",
            "Remote secret operations issued by the push reconciler",
        ),
        &["operation"],
    )
    .expect("Failed to create PUSH_OPERATIONS_TOTAL metric - this should never happen")
});

static LEASE_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_operator_lease_operations_total",
            "Lease operations issued by the dynamic reconciler",
        ),
        &["operation"],
    )
    .expect("Failed to create LEASE_OPERATIONS_TOTAL metric - this should never happen")
});

static SECRETS_SYNCED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "kms_operator_secrets_synced",
        "Number of secrets synced by the last pull reconciliation",
    )
    .expect("Failed to create SECRETS_SYNCED metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    REGISTRY.register(Box::new(PUSH_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LEASE_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRETS_SYNCED.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconcile_duration(kind: &str, duration: f64) {
    RECONCILE_DURATION.with_label_values(&[kind]).observe(duration);
}

pub fn increment_push_operation(operation: &str) {
    PUSH_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_lease_operation(operation: &str) {
    LEASE_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn set_secrets_synced(count: i64) {
    SECRETS_SYNCED.set(count);
}
