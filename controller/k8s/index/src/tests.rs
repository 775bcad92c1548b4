use crate::{activation, ops, Index, Op};
use iprule_controller_core::{content_hash, RuleKey};
use iprule_controller_k8s_api::{
    self as k8s, config::SPEC_HASH_ANNOTATION, IPRule, IPRuleConfig, IPRuleConfigSpec, IPRuleSpec,
    ObjectMeta, RuleState,
};
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Service, ServiceSpec, ServiceStatus,
};

fn mk_rule(name: &str, cidr: &str, table: u32, priority: u32) -> IPRule {
    IPRule::new(
        name,
        IPRuleSpec {
            cidr: cidr.to_string(),
            table,
            priority,
        },
    )
}

fn mk_service(namespace: &str, name: &str, cluster_ip: &str, lb_ips: &[&str]) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ..Default::default()
        }),
        status: Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(
                    lb_ips
                        .iter()
                        .map(|ip| LoadBalancerIngress {
                            ip: Some(ip.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
            }),
            ..Default::default()
        }),
    }
}

fn mk_config(owner: &str, table: u32, priority: u32, state: RuleState) -> IPRuleConfig {
    let key = RuleKey {
        owner: owner.parse().unwrap(),
        table,
        priority,
    };
    let mut cfg = IPRuleConfig::new(
        &IPRuleConfig::name_for(&key.owner, table, priority),
        IPRuleConfigSpec {
            table,
            priority,
            service_ip: owner.to_string(),
            state,
        },
    );
    cfg.metadata.labels = Some(
        [(k8s::MANAGED_BY_LABEL.to_string(), k8s::MANAGED_BY_VALUE.to_string())]
            .into_iter()
            .collect(),
    );
    if state == RuleState::Present {
        cfg.metadata.annotations = Some(
            [(
                SPEC_HASH_ANNOTATION.to_string(),
                content_hash(&key, state.as_str()),
            )]
            .into_iter()
            .collect(),
        );
    }
    cfg
}

fn key(owner: &str, table: u32, priority: u32) -> RuleKey {
    RuleKey {
        owner: owner.parse().unwrap(),
        table,
        priority,
    }
}

#[test]
fn index_resolves_policy_against_binding() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &["10.0.0.5"]));

    let desired = index.read().desired();
    assert_eq!(desired.len(), 1);
    let config = &desired[&key("192.168.1.10", 100, 1000)];
    assert_eq!(config.rule.policy, "edge");
}

#[test]
fn service_without_ingress_contributes_nothing() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &[]));

    assert!(index.read().desired().is_empty());
}

#[test]
fn invalid_cluster_ip_is_skipped() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "None", &["10.0.0.5"]));

    assert!(index.read().desired().is_empty());
}

#[test]
fn change_signal_fires_only_on_real_changes() {
    let (index, mut rx) = Index::shared();
    rx.borrow_and_update();

    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    assert!(rx.has_changed().unwrap());
    rx.borrow_and_update();

    // Re-applying the identical rule must not wake the controller.
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    assert!(!rx.has_changed().unwrap());

    index.write().delete_rule("edge");
    assert!(rx.has_changed().unwrap());
}

#[test]
fn reset_replaces_prior_state() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("old", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &["10.1.0.5"]));

    index
        .write()
        .reset_rules(vec![mk_rule("new", "10.1.0.0/24", 200, 2000)]);

    let desired = index.read().desired();
    assert_eq!(desired.len(), 1);
    assert!(desired.contains_key(&key("192.168.1.10", 200, 2000)));
}

#[test]
fn plan_creates_missing_records() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &["10.0.0.5"]));

    let desired = index.read().desired();
    let plan = ops::plan(&desired, &[]);
    assert_eq!(plan.len(), 1);
    match &plan[0] {
        Op::Upsert { name, .. } => assert_eq!(name, "iprc-192-168-1-10-100-1000"),
        op => panic!("unexpected op: {:?}", op),
    }
}

#[test]
fn plan_is_idempotent_when_hashes_match() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &["10.0.0.5"]));

    let desired = index.read().desired();
    let existing = vec![mk_config("192.168.1.10", 100, 1000, RuleState::Present)];
    assert_eq!(ops::plan(&desired, &existing), vec![]);
}

#[test]
fn plan_rewrites_stale_records() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &["10.0.0.5"]));

    let desired = index.read().desired();
    let mut stale = mk_config("192.168.1.10", 100, 1000, RuleState::Present);
    stale
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SPEC_HASH_ANNOTATION.to_string(), "stale".to_string());

    let plan = ops::plan(&desired, &[stale]);
    assert!(matches!(&plan[..], [Op::Upsert { .. }]));
}

#[test]
fn plan_resurrects_absent_records_that_are_desired_again() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("edge", "10.0.0.0/24", 100, 1000));
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &["10.0.0.5"]));

    let desired = index.read().desired();
    // Absent records carry no hash, so the upsert fires and flips it back.
    let absent = mk_config("192.168.1.10", 100, 1000, RuleState::Absent);
    let plan = ops::plan(&desired, &[absent]);
    assert!(matches!(&plan[..], [Op::Upsert { .. }]));
}

#[test]
fn plan_prunes_unmatched_records() {
    let desired = Default::default();
    let existing = vec![mk_config("192.168.1.10", 100, 1000, RuleState::Present)];
    let plan = ops::plan(&desired, &existing);
    assert_eq!(
        plan,
        vec![Op::MarkAbsent {
            name: "iprc-192-168-1-10-100-1000".to_string()
        }]
    );
}

#[test]
fn plan_leaves_absent_records_to_the_barrier() {
    let desired = Default::default();
    let existing = vec![mk_config("192.168.1.10", 100, 1000, RuleState::Absent)];
    assert_eq!(ops::plan(&desired, &existing), vec![]);
}

#[test]
fn plan_never_touches_unmanaged_records() {
    let desired = Default::default();
    let mut foreign = mk_config("192.168.1.10", 100, 1000, RuleState::Present);
    foreign.metadata.labels = None;
    assert_eq!(ops::plan(&desired, &[foreign]), vec![]);
}

#[test]
fn plan_keeps_two_keys_of_one_owner_separate() {
    let (index, _rx) = Index::shared();
    index.write().apply_rule(mk_rule("a", "10.0.0.0/24", 100, 1000));
    index.write().apply_rule(mk_rule("b", "10.1.0.0/24", 200, 2000));
    index.write().apply_service(mk_service(
        "default",
        "web",
        "192.168.1.10",
        &["10.0.0.5", "10.1.0.5"],
    ));

    let desired = index.read().desired();
    assert_eq!(desired.len(), 2);

    // With one record already converged, only the other is written.
    let existing = vec![mk_config("192.168.1.10", 100, 1000, RuleState::Present)];
    let plan = ops::plan(&desired, &existing);
    assert_eq!(plan.len(), 1);
    match &plan[0] {
        Op::Upsert { name, .. } => assert_eq!(name, "iprc-192-168-1-10-200-2000"),
        op => panic!("unexpected op: {:?}", op),
    }
}

#[test]
fn activation_smallest_name_wins() {
    let peers = vec!["ctl-b".to_string(), "ctl-a".to_string(), "ctl-c".to_string()];
    assert!(activation::decide("ctl-a", peers.clone()));
    assert!(!activation::decide("ctl-b", peers));
}

#[test]
fn activation_defaults_to_active_when_alone() {
    assert!(activation::decide("ctl-a", vec![]));
    // Not present in the listing: still participates with its own name.
    assert!(!activation::decide("ctl-z", vec!["ctl-a".to_string()]));
}

#[test]
fn desired_configs_carry_owner_references() {
    let (index, _rx) = Index::shared();
    let mut rule = mk_rule("edge", "10.0.0.0/24", 100, 1000);
    rule.metadata.uid = Some("uid-123".to_string());
    index.write().apply_rule(rule);
    index
        .write()
        .apply_service(mk_service("default", "web", "192.168.1.10", &["10.0.0.5"]));

    let desired = index.read().desired();
    let owner = desired[&key("192.168.1.10", 100, 1000)]
        .owner
        .as_ref()
        .expect("owner reference");
    assert_eq!(owner.name, "edge");
    assert_eq!(owner.uid, "uid-123");
    assert_eq!(owner.controller, Some(true));
}
