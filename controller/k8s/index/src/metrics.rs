use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Metrics for the resolution engine, registered once at startup and handed
/// to the controller explicitly so tests can run with a throwaway registry.
pub struct ControllerMetrics {
    pub(crate) reconciles: Counter,
    pub(crate) reconcile_errors: Counter,
    pub(crate) reconcile_duration: Histogram,
    pub(crate) configs_created: Counter,
    pub(crate) configs_updated: Counter,
    pub(crate) configs_marked_absent: Counter,
    pub(crate) desired: Gauge,
    pub(crate) absent: Gauge,
    pub(crate) active: Gauge,
    pub(crate) ready: Gauge,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Counter::default();
        prom.register(
            "reconciles",
            "Count of reconciliation passes",
            reconciles.clone(),
        );

        let reconcile_errors = Counter::default();
        prom.register(
            "reconcile_errors",
            "Count of reconciliation passes that failed",
            reconcile_errors.clone(),
        );

        let reconcile_duration = Histogram::new(
            prometheus_client::metrics::histogram::exponential_buckets(0.005, 2.0, 12),
        );
        prom.register(
            "reconcile_duration_seconds",
            "Duration of a reconciliation pass",
            reconcile_duration.clone(),
        );

        let configs_created = Counter::default();
        prom.register(
            "configs_created",
            "Count of rule records created",
            configs_created.clone(),
        );

        let configs_updated = Counter::default();
        prom.register(
            "configs_updated",
            "Count of rule records updated",
            configs_updated.clone(),
        );

        let configs_marked_absent = Counter::default();
        prom.register(
            "configs_marked_absent",
            "Count of rule records transitioned to absent",
            configs_marked_absent.clone(),
        );

        let desired = Gauge::default();
        prom.register(
            "desired_configs",
            "Number of desired rule records",
            desired.clone(),
        );

        let absent = Gauge::default();
        prom.register(
            "absent_configs",
            "Number of rule records currently marked absent",
            absent.clone(),
        );

        let active = Gauge::default();
        prom.register(
            "active",
            "Whether this replica is the active writer",
            active.clone(),
        );

        let ready = Gauge::default();
        prom.register(
            "ready",
            "Whether a reconciliation pass has succeeded since startup",
            ready.clone(),
        );

        Self {
            reconciles,
            reconcile_errors,
            reconcile_duration,
            configs_created,
            configs_updated,
            configs_marked_absent,
            desired,
            absent,
            active,
            ready,
        }
    }
}
