use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Agent metrics, registered once at startup and passed into the
/// synchronizer explicitly.
pub struct AgentMetrics {
    pub(crate) passes: Counter,
    pub(crate) pass_errors: Counter,
    pub(crate) pass_duration: Histogram,
    pub(crate) rules_added: Counter,
    pub(crate) rules_deleted: Counter,
    pub(crate) rule_errors: Counter,
    pub(crate) configs_processed: Counter,
    pub(crate) configs_deleted: Counter,
    pub(crate) acks_set: Counter,
    pub(crate) desired_rules: Gauge,
    pub(crate) present_rules: Gauge,
    pub(crate) absent_configs: Gauge,
    pub(crate) ready: Gauge,
}

// === impl AgentMetrics ===

impl AgentMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let passes = Counter::default();
        prom.register("passes", "Count of synchronization passes", passes.clone());

        let pass_errors = Counter::default();
        prom.register(
            "pass_errors",
            "Count of synchronization passes that failed",
            pass_errors.clone(),
        );

        let pass_duration = Histogram::new(
            prometheus_client::metrics::histogram::exponential_buckets(0.005, 2.0, 12),
        );
        prom.register(
            "pass_duration_seconds",
            "Duration of a synchronization pass",
            pass_duration.clone(),
        );

        let rules_added = Counter::default();
        prom.register(
            "rules_added",
            "Count of ip rules successfully added",
            rules_added.clone(),
        );

        let rules_deleted = Counter::default();
        prom.register(
            "rules_deleted",
            "Count of ip rules successfully deleted",
            rules_deleted.clone(),
        );

        let rule_errors = Counter::default();
        prom.register(
            "rule_errors",
            "Count of failed ip rule mutations",
            rule_errors.clone(),
        );

        let configs_processed = Counter::default();
        prom.register(
            "configs_processed",
            "Count of rule records processed",
            configs_processed.clone(),
        );

        let configs_deleted = Counter::default();
        prom.register(
            "configs_deleted",
            "Count of fully acknowledged rule records deleted",
            configs_deleted.clone(),
        );

        let acks_set = Counter::default();
        prom.register(
            "acks_set",
            "Count of cleanup acknowledgments written by this node",
            acks_set.clone(),
        );

        let desired_rules = Gauge::default();
        prom.register(
            "desired_rules",
            "Number of records desiring a present rule",
            desired_rules.clone(),
        );

        let present_rules = Gauge::default();
        prom.register(
            "present_rules",
            "Number of host-scope rules present in the kernel",
            present_rules.clone(),
        );

        let absent_configs = Gauge::default();
        prom.register(
            "absent_configs",
            "Number of records currently marked absent",
            absent_configs.clone(),
        );

        let ready = Gauge::default();
        prom.register(
            "ready",
            "Whether a synchronization pass has succeeded since startup",
            ready.clone(),
        );

        Self {
            passes,
            pass_errors,
            pass_duration,
            rules_added,
            rules_deleted,
            rule_errors,
            configs_processed,
            configs_deleted,
            acks_set,
            desired_rules,
            present_rules,
            absent_configs,
            ready,
        }
    }
}
