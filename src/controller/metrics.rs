//! Prometheus metrics for the Astarte operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `astarte_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `astarte_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `astarte_cluster_health` (gauge): 0 green, 1 yellow, 2 red, labeled by namespace/name.
//! - `astarte_deployed_components` (gauge): number of deployed components, labeled by namespace/name.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::ClusterHealth;

/// Labels identifying one Astarte instance
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub namespace: String,
    pub name: String,
}

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "astarte"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::kind`
    pub kind: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the health signal of each instance
pub static CLUSTER_HEALTH: Lazy<Family<InstanceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static DEPLOYED_COMPONENTS: Lazy<Family<InstanceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "astarte_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    // The counter encoder appends the _total suffix
    registry.register(
        "astarte_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS.clone(),
    );
    registry.register(
        "astarte_cluster_health",
        "Aggregate health of the Astarte cluster (0 green, 1 yellow, 2 red)",
        CLUSTER_HEALTH.clone(),
    );
    registry.register(
        "astarte_deployed_components",
        "Number of components deployed for the Astarte cluster",
        DEPLOYED_COMPONENTS.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS.get_or_create(&labels).inc();
}

pub fn set_cluster_health(namespace: &str, name: &str, health: ClusterHealth) {
    let labels = InstanceLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    CLUSTER_HEALTH.get_or_create(&labels).set(health.severity());
}

pub fn set_deployed_components(namespace: &str, name: &str, count: usize) {
    let labels = InstanceLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    DEPLOYED_COMPONENTS
        .get_or_create(&labels)
        .set(count as i64);
}
