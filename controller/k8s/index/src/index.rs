use ahash::AHashMap as HashMap;
use futures::prelude::*;
use iprule_controller_core::{resolve, DesiredRule, RoutePolicy, RuleKey, VipBinding};
use iprule_controller_k8s_api::{IPRule, Resource, ResourceExt, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::watcher;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the resolution inputs: the policy set and the service bindings.
/// Owned by the watch tasks; read by the controller when a pass runs.
#[derive(Debug)]
pub struct Index {
    policies: HashMap<String, Policy>,
    services: HashMap<ServiceRef, VipBinding>,
    changed: watch::Sender<()>,
}

#[derive(Debug, PartialEq, Eq)]
struct Policy {
    route: RoutePolicy,
    uid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ServiceRef {
    namespace: String,
    name: String,
}

/// A desired record together with the owner reference of the policy that won
/// it. The owner reference is best-effort bookkeeping only.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredConfig {
    pub rule: DesiredRule,
    pub owner: Option<OwnerReference>,
}

// === impl Index ===

impl Index {
    pub fn shared() -> (SharedIndex, watch::Receiver<()>) {
        let (changed, rx) = watch::channel(());
        let idx = Self {
            policies: HashMap::default(),
            services: HashMap::default(),
            changed,
        };
        (Arc::new(RwLock::new(idx)), rx)
    }

    /// Computes the deduplicated, longest-prefix-resolved desired set from
    /// the current inputs.
    pub fn desired(&self) -> HashMap<RuleKey, DesiredConfig> {
        let policies = self
            .policies
            .values()
            .map(|p| p.route.clone())
            .collect::<Vec<_>>();
        let bindings = self.services.values().cloned().collect::<Vec<_>>();

        resolve(&policies, &bindings)
            .into_iter()
            .map(|(key, rule)| {
                let owner = self
                    .policies
                    .get(&rule.policy)
                    .and_then(|p| mk_owner_ref(&rule.policy, p.uid.as_deref()));
                (key, DesiredConfig { rule, owner })
            })
            .collect()
    }

    pub fn apply_rule(&mut self, rule: IPRule) {
        let name = rule.name_any();
        match mk_policy(&rule) {
            Some(policy) => {
                if self.policies.get(&name) != Some(&policy) {
                    self.policies.insert(name, policy);
                    self.bump();
                }
            }
            None => {
                tracing::warn!(%name, cidr = %rule.spec.cidr, "Ignoring IPRule with invalid CIDR");
                if self.policies.remove(&name).is_some() {
                    self.bump();
                }
            }
        }
    }

    pub fn delete_rule(&mut self, name: &str) {
        if self.policies.remove(name).is_some() {
            self.bump();
        }
    }

    pub fn reset_rules(&mut self, rules: Vec<IPRule>) {
        let next = rules
            .iter()
            .filter_map(|r| mk_policy(r).map(|p| (r.name_any(), p)))
            .collect::<HashMap<_, _>>();
        if next != self.policies {
            self.policies = next;
            self.bump();
        }
    }

    pub fn apply_service(&mut self, svc: Service) {
        let key = ServiceRef {
            namespace: svc.namespace().unwrap_or_default(),
            name: svc.name_any(),
        };
        match mk_binding(&svc) {
            Some(binding) => {
                if self.services.get(&key) != Some(&binding) {
                    self.services.insert(key, binding);
                    self.bump();
                }
            }
            None => {
                if self.services.remove(&key).is_some() {
                    self.bump();
                }
            }
        }
    }

    pub fn delete_service(&mut self, namespace: String, name: String) {
        let key = ServiceRef { namespace, name };
        if self.services.remove(&key).is_some() {
            self.bump();
        }
    }

    pub fn reset_services(&mut self, services: Vec<Service>) {
        let next = services
            .iter()
            .filter_map(|s| {
                let key = ServiceRef {
                    namespace: s.namespace().unwrap_or_default(),
                    name: s.name_any(),
                };
                mk_binding(s).map(|b| (key, b))
            })
            .collect::<HashMap<_, _>>();
        if next != self.services {
            self.services = next;
            self.bump();
        }
    }

    fn bump(&self) {
        let _ = self.changed.send(());
    }
}

fn mk_policy(rule: &IPRule) -> Option<Policy> {
    let cidr = rule.spec.cidr.parse().ok()?;
    Some(Policy {
        route: RoutePolicy {
            name: rule.name_any(),
            cidr,
            table: rule.spec.table,
            priority: rule.spec.priority,
        },
        uid: rule.uid(),
    })
}

/// Extracts the clusterIP -> LoadBalancer ingress IP binding of a service.
/// Services without a parseable clusterIP or without ingress IPs contribute
/// nothing.
fn mk_binding(svc: &Service) -> Option<VipBinding> {
    let owner = svc
        .spec
        .as_ref()?
        .cluster_ip
        .as_deref()?
        .parse()
        .ok()?;

    let vips = svc
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .filter_map(|ing| ing.ip.as_deref()?.parse().ok())
        .collect::<Vec<_>>();

    if vips.is_empty() {
        return None;
    }
    Some(VipBinding { owner, vips })
}

fn mk_owner_ref(name: &str, uid: Option<&str>) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: IPRule::api_version(&()).to_string(),
        kind: IPRule::kind(&()).to_string(),
        name: name.to_string(),
        uid: uid?.to_string(),
        controller: Some(true),
        block_owner_deletion: None,
    })
}

/// Feeds `IPRule` watch events into the index.
pub async fn index_rules(index: SharedIndex, events: impl Stream<Item = watcher::Event<IPRule>>) {
    tokio::pin!(events);
    while let Some(ev) = events.next().await {
        match ev {
            watcher::Event::Applied(rule) => index.write().apply_rule(rule),
            watcher::Event::Deleted(rule) => index.write().delete_rule(&rule.name_any()),
            watcher::Event::Restarted(rules) => index.write().reset_rules(rules),
        }
    }
}

/// Feeds `Service` watch events into the index.
pub async fn index_services(
    index: SharedIndex,
    events: impl Stream<Item = watcher::Event<Service>>,
) {
    tokio::pin!(events);
    while let Some(ev) = events.next().await {
        match ev {
            watcher::Event::Applied(svc) => index.write().apply_service(svc),
            watcher::Event::Deleted(svc) => {
                let namespace = svc.namespace().unwrap_or_default();
                let name = svc.name_any();
                index.write().delete_service(namespace, name);
            }
            watcher::Event::Restarted(services) => index.write().reset_services(services),
        }
    }
}
