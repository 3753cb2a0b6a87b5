//! Prometheus metrics for the policy pipeline

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

use crate::policy::PolicyCondition;

/// Violations accepted into a per-condition queue
static VIOLATIONS_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpolicy_violations_enqueued_total",
            "Total number of violations queued for delivery"
        ),
        &["condition"]
    )
    .expect("Failed to create violations_enqueued metric")
});

/// Violations discarded because their queue was full
static VIOLATIONS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpolicy_violations_dropped_total",
            "Total number of violations discarded on a full queue"
        ),
        &["condition"]
    )
    .expect("Failed to create violations_dropped metric")
});

/// Violations forwarded to a consumer stream
static VIOLATIONS_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpolicy_violations_delivered_total",
            "Total number of violations delivered to consumers"
        ),
        &["condition"]
    )
    .expect("Failed to create violations_delivered metric")
});

/// Failed native unregister calls
static UNREGISTER_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "gpolicy_unregister_failures_total",
        "Total number of failed policy unregister calls"
    ))
    .expect("Failed to create unregister_failures metric")
});

/// Ephemeral group releases, by what unblocked them
static GROUP_RELEASES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpolicy_group_releases_total",
            "Total number of ephemeral policy groups released"
        ),
        &["reason"]
    )
    .expect("Failed to create group_releases metric")
});

/// Registrations with a running fan-in
static ACTIVE_REGISTRATIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "gpolicy_active_registrations",
        "Number of active policy registrations"
    ))
    .expect("Failed to create active_registrations metric")
});

/// Metrics registry wrapper
#[derive(Debug, Clone, Copy)]
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*VIOLATIONS_ENQUEUED;
        let _ = &*VIOLATIONS_DROPPED;
        let _ = &*VIOLATIONS_DELIVERED;
        let _ = &*UNREGISTER_FAILURES;
        let _ = &*GROUP_RELEASES;
        let _ = &*ACTIVE_REGISTRATIONS;
        Self
    }

    pub fn inc_enqueued(&self, condition: PolicyCondition) {
        VIOLATIONS_ENQUEUED
            .with_label_values(&[condition.label()])
            .inc();
    }

    pub fn inc_dropped(&self, condition: PolicyCondition) {
        VIOLATIONS_DROPPED
            .with_label_values(&[condition.label()])
            .inc();
    }

    pub fn inc_delivered(&self, condition: PolicyCondition) {
        VIOLATIONS_DELIVERED
            .with_label_values(&[condition.label()])
            .inc();
    }

    pub fn inc_unregister_failure(&self) {
        UNREGISTER_FAILURES.inc();
    }

    /// Record an ephemeral group release (`confirmed` or `timeout`)
    pub fn inc_group_release(&self, reason: &str) {
        GROUP_RELEASES.with_label_values(&[reason]).inc();
    }

    pub fn registration_started(&self) {
        ACTIVE_REGISTRATIONS.inc();
    }

    pub fn registration_closed(&self) {
        ACTIVE_REGISTRATIONS.dec();
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode(&self) -> String {
        prometheus::TextEncoder::new()
            .encode_to_string(&prometheus::gather())
            .unwrap_or_default()
    }

    /// Dropped violations so far for a condition
    pub fn dropped(&self, condition: PolicyCondition) -> u64 {
        VIOLATIONS_DROPPED
            .with_label_values(&[condition.label()])
            .get()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();
        let before = registry.dropped(PolicyCondition::Xid);

        registry.inc_enqueued(PolicyCondition::Xid);
        registry.inc_dropped(PolicyCondition::Xid);
        registry.inc_delivered(PolicyCondition::Xid);
        registry.inc_unregister_failure();
        registry.inc_group_release("timeout");
        registry.registration_started();
        registry.registration_closed();

        assert!(registry.dropped(PolicyCondition::Xid) > before);
    }

    #[test]
    fn test_encode_includes_pipeline_series() {
        let registry = MetricsRegistry::new();
        registry.inc_unregister_failure();

        let text = registry.encode();
        assert!(text.contains("gpolicy_unregister_failures_total"));
        assert!(text.contains("gpolicy_active_registrations"));
    }
}
