//! The node synchronizer.
//!
//! Converges the local kernel with the managed record set on a fixed
//! interval, then walks absent records through the acknowledgment barrier:
//! ack locally once the rule is gone, and retire the record once every
//! currently-listed node has acked. Resurrection (a record flipping back to
//! present mid-flight) aborts every step silently; the next pass starts
//! over from fresh state.

use crate::{
    metrics::AgentMetrics,
    rules::{RuleError, RuleIndex, RuleStore},
};
use anyhow::Result;
use iprule_controller_core::retry::Retry;
use iprule_controller_k8s_api::{
    self as k8s,
    config::CLEANUP_ACK_DONE,
    is_conflict, is_not_found, CleanupAcks, DeleteParams, IPRuleConfig, IPRuleConfigSpec,
    ListParams, Node, Preconditions, ResourceExt, RuleState,
};
use std::net::IpAddr;
use tokio::time;
use tracing::{debug, info, warn};

/// Attempts per record-store write; conflicts refetch and retry, and an
/// exhausted budget just waits for the next pass.
const WRITE_ATTEMPTS: u32 = 3;

/// What a kernel convergence step did for one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Converged {
    /// The kernel already matched the record.
    AlreadyCorrect,
    Added,
    Removed,
}

pub struct Synchronizer<S> {
    client: k8s::Client,
    store: S,
    node: Option<String>,
    period: time::Duration,
    retry: Retry,
    metrics: AgentMetrics,
}

// === impl Synchronizer ===

impl<S: RuleStore + Sync> Synchronizer<S> {
    pub fn new(
        client: k8s::Client,
        store: S,
        node: Option<String>,
        period: time::Duration,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            client,
            store,
            node,
            period,
            retry: Retry::default(),
            metrics,
        }
    }

    pub async fn run(self) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let start = time::Instant::now();
            self.metrics.passes.inc();
            match self.pass().await {
                Ok(()) => {
                    self.metrics.ready.set(1);
                }
                Err(error) => {
                    self.metrics.pass_errors.inc();
                    warn!(%error, "Synchronization pass failed");
                }
            }
            self.metrics
                .pass_duration
                .observe(start.elapsed().as_secs_f64());
        }
    }

    /// One full pass: a single kernel dump, a single record listing, then
    /// per-record convergence. Failures are scoped to their record.
    async fn pass(&self) -> Result<()> {
        let api = k8s::Api::<IPRuleConfig>::all(self.client.clone());
        let configs = api.list(&k8s::managed_params()).await?.items;

        let index = RuleIndex::from_rules(self.store.list().await?);
        self.metrics.present_rules.set(index.len() as i64);

        let mut desired_present = 0;
        let mut absent = 0;

        for cfg in &configs {
            if !cfg.is_managed() {
                continue;
            }
            self.metrics.configs_processed.inc();
            match cfg.spec.state {
                RuleState::Present => {
                    desired_present += 1;
                    self.ensure_present(cfg, &index).await;
                }
                RuleState::Absent => {
                    absent += 1;
                    self.retire(cfg, &index).await;
                }
            }
        }

        self.metrics.desired_rules.set(desired_present);
        self.metrics.absent_configs.set(absent);
        Ok(())
    }

    async fn ensure_present(&self, cfg: &IPRuleConfig, index: &RuleIndex) {
        match converge_kernel(&self.store, &self.retry, &cfg.spec, index).await {
            Ok(Converged::Added) => {
                self.metrics.rules_added.inc();
                info!(
                    src = %cfg.spec.service_ip,
                    table = cfg.spec.table,
                    priority = cfg.spec.priority,
                    "Added ip rule"
                );
            }
            Ok(_) => {}
            Err(error) => {
                self.metrics.rule_errors.inc();
                warn!(
                    name = %cfg.name_any(),
                    src = %cfg.spec.service_ip,
                    %error,
                    "Failed to add ip rule"
                );
            }
        }
    }

    /// Removes the local rule for an absent record, then advances the
    /// acknowledgment barrier. Without a node identity the kernel is still
    /// cleaned but the record is left untouched.
    async fn retire(&self, cfg: &IPRuleConfig, index: &RuleIndex) {
        match converge_kernel(&self.store, &self.retry, &cfg.spec, index).await {
            Ok(Converged::Removed) => {
                self.metrics.rules_deleted.inc();
                info!(
                    src = %cfg.spec.service_ip,
                    table = cfg.spec.table,
                    priority = cfg.spec.priority,
                    "Deleted ip rule"
                );
            }
            Ok(_) => {}
            Err(error) => {
                self.metrics.rule_errors.inc();
                warn!(
                    name = %cfg.name_any(),
                    src = %cfg.spec.service_ip,
                    %error,
                    "Failed to delete ip rule; not acknowledging"
                );
                return;
            }
        }

        let Some(node) = self.node.as_deref() else {
            return;
        };
        if let Err(error) = self.advance_barrier(&cfg.name_any(), node).await {
            warn!(name = %cfg.name_any(), %error, "Acknowledgment barrier step failed");
        }
    }

    /// LocalCleanupPending -> LocalAcked -> (all nodes) -> record deleted.
    async fn advance_barrier(&self, name: &str, node: &str) -> Result<()> {
        let Some(fresh) = self.ack(name, node).await? else {
            // Resurrected, gone, or conflicted out; nothing more this pass.
            return Ok(());
        };

        let nodes = k8s::Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items;
        let node_names = nodes.iter().map(|n| n.name_any()).collect::<Vec<_>>();

        if self.finalize(&fresh, &node_names).await? {
            self.metrics.configs_deleted.inc();
            info!(%name, nodes = node_names.len(), "Deleted fully acknowledged IPRuleConfig");
        }
        Ok(())
    }

    /// Sets this node's ack with a freshness check, retrying conflicts.
    /// Returns the fresh record while it remains absent, `None` otherwise.
    async fn ack(&self, name: &str, node: &str) -> Result<Option<IPRuleConfig>> {
        let api = k8s::Api::<IPRuleConfig>::all(self.client.clone());
        let pp = k8s::PostParams::default();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(mut cfg) = api.get_opt(name).await? else {
                return Ok(None);
            };
            if cfg.spec.state != RuleState::Absent {
                // Resurrected while we were cleaning up: abort silently.
                debug!(%name, "Record is present again; dropping ack");
                return Ok(None);
            }
            if cfg.cleanup_acks().contains(node) {
                return Ok(Some(cfg));
            }
            cfg.annotations_mut().insert(
                CleanupAcks::annotation_key(node),
                CLEANUP_ACK_DONE.to_string(),
            );
            match api.replace(name, &pp, &cfg).await {
                Ok(fresh) => {
                    self.metrics.acks_set.inc();
                    debug!(%name, %node, "Acknowledged local cleanup");
                    return Ok(Some(fresh));
                }
                Err(e) if is_conflict(&e) && attempt < WRITE_ATTEMPTS => continue,
                Err(e) if is_conflict(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Deletes the record iff every currently-listed node has acked, with the
    /// delete preconditioned on the verified version so a concurrent
    /// resurrection wins the race.
    async fn finalize(&self, fresh: &IPRuleConfig, nodes: &[String]) -> Result<bool> {
        if fresh.spec.state != RuleState::Absent {
            return Ok(false);
        }
        if !fresh
            .cleanup_acks()
            .covers(nodes.iter().map(String::as_str))
        {
            return Ok(false);
        }

        let name = fresh.name_any();
        let api = k8s::Api::<IPRuleConfig>::all(self.client.clone());
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: fresh.resource_version(),
                uid: fresh.uid(),
            }),
            ..Default::default()
        };
        match api.delete(&name, &dp).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(true),
            // The record changed under us; whoever changed it decides.
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Converges the kernel for a single record: present records get their rule
/// added, absent records get it removed, both through the retry executor.
pub(crate) async fn converge_kernel<S: RuleStore + Sync>(
    store: &S,
    retry: &Retry,
    spec: &IPRuleConfigSpec,
    index: &RuleIndex,
) -> Result<Converged, RuleError> {
    let src: IpAddr = match spec.service_ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            return match spec.state {
                // Nothing in the kernel can match an unparseable address, so
                // an absent record is already clean.
                RuleState::Absent => Ok(Converged::AlreadyCorrect),
                RuleState::Present => {
                    Err(RuleError::Invalid(format!("bad address {}", spec.service_ip)))
                }
            };
        }
    };
    if spec.table == 0 {
        return match spec.state {
            RuleState::Absent => Ok(Converged::AlreadyCorrect),
            RuleState::Present => Err(RuleError::Invalid("table must be set".to_string())),
        };
    }

    let present = index.contains(src, spec.table, spec.priority);
    match spec.state {
        RuleState::Present if present => Ok(Converged::AlreadyCorrect),
        RuleState::Present => {
            retry
                .run(|| store.add(src, spec.table, spec.priority))
                .await?;
            Ok(Converged::Added)
        }
        RuleState::Absent if present => {
            retry
                .run(|| store.delete(src, spec.table, spec.priority))
                .await?;
            Ok(Converged::Removed)
        }
        RuleState::Absent => Ok(Converged::AlreadyCorrect),
    }
}
