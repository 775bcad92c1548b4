use crate::{index::SharedIndex, ops, Activation, ControllerMetrics, DesiredConfig, Op};
use anyhow::Result;
use iprule_controller_k8s_api::{
    self as k8s, is_conflict, IPRuleConfig, IPRuleConfigSpec, ResourceExt, RuleState,
};
use iprule_controller_k8s_api::config::SPEC_HASH_ANNOTATION;
use tokio::{sync::watch, time};
use tracing::{debug, info, warn};

/// Attempts per store write before deferring to the next pass; conflicts are
/// expected under concurrent writers and resolved by refetching.
const WRITE_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Created,
    Updated,
    Unchanged,
}

/// Executes reconcile passes: snapshot the index, plan operations, apply them
/// to the API with compare-and-swap writes.
pub struct Controller {
    client: k8s::Client,
    index: SharedIndex,
    changed: watch::Receiver<()>,
    period: time::Duration,
    activation: Activation,
    metrics: ControllerMetrics,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: k8s::Client,
        index: SharedIndex,
        changed: watch::Receiver<()>,
        period: time::Duration,
        activation: Activation,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            index,
            changed,
            period,
            activation,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                res = self.changed.changed() => {
                    if res.is_err() {
                        // Index dropped; nothing left to reconcile.
                        return;
                    }
                }
            }

            let start = time::Instant::now();
            self.metrics.reconciles.inc();
            match self.reconcile().await {
                Ok(()) => {
                    self.metrics.ready.set(1);
                }
                Err(error) => {
                    self.metrics.reconcile_errors.inc();
                    warn!(%error, "Reconciliation pass failed");
                }
            }
            self.metrics
                .reconcile_duration
                .observe(start.elapsed().as_secs_f64());
        }
    }

    async fn reconcile(&mut self) -> Result<()> {
        if !self.activation.is_active().await? {
            self.metrics.active.set(0);
            debug!("Standby instance; skipping mutation");
            return Ok(());
        }
        self.metrics.active.set(1);

        let desired = self.index.read().desired();
        let api = k8s::Api::<IPRuleConfig>::all(self.client.clone());
        let existing = api.list(&k8s::managed_params()).await?.items;

        let mut created = 0;
        let mut updated = 0;
        let mut unchanged = desired.len();
        let mut newly_absent = 0;

        for op in ops::plan(&desired, &existing) {
            match op {
                Op::Upsert { name, hash, config } => match self.upsert(&name, &hash, &config).await
                {
                    Ok(Outcome::Created) => {
                        created += 1;
                        unchanged -= 1;
                        self.metrics.configs_created.inc();
                    }
                    Ok(Outcome::Updated) => {
                        updated += 1;
                        unchanged -= 1;
                        self.metrics.configs_updated.inc();
                    }
                    Ok(Outcome::Unchanged) => {}
                    Err(error) => {
                        unchanged -= 1;
                        warn!(%name, %error, "Failed to upsert IPRuleConfig");
                    }
                },
                Op::MarkAbsent { name } => match self.mark_absent(&name).await {
                    Ok(true) => {
                        newly_absent += 1;
                        self.metrics.configs_marked_absent.inc();
                        info!(%name, "Marked IPRuleConfig absent");
                    }
                    Ok(false) => {}
                    Err(error) => {
                        warn!(%name, %error, "Failed to mark IPRuleConfig absent");
                    }
                },
            }
        }

        let absent_total = existing
            .iter()
            .filter(|cfg| cfg.spec.state == RuleState::Absent)
            .count()
            + newly_absent;
        self.metrics.desired.set(desired.len() as i64);
        self.metrics.absent.set(absent_total as i64);

        info!(
            desired = desired.len(),
            created, updated, unchanged, newly_absent, absent_total,
            "Reconciled rule configs"
        );
        Ok(())
    }

    /// Creates or rewrites a record, skipping the write when the stored hash
    /// already matches. Conflicts refetch and retry.
    async fn upsert(&self, name: &str, hash: &str, config: &DesiredConfig) -> Result<Outcome> {
        let api = k8s::Api::<IPRuleConfig>::all(self.client.clone());
        let pp = k8s::PostParams::default();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = match api.get_opt(name).await? {
                None => {
                    let cfg = mk_config(name, hash, config);
                    api.create(&pp, &cfg).await.map(|_| Outcome::Created)
                }
                Some(mut cfg) => {
                    // Re-check against the live object so stale plans stay
                    // idempotent.
                    if cfg.spec.state == RuleState::Present && cfg.spec_hash() == Some(hash) {
                        return Ok(Outcome::Unchanged);
                    }
                    mutate_config(&mut cfg, hash, config);
                    api.replace(name, &pp, &cfg).await.map(|_| Outcome::Updated)
                }
            };
            match res {
                Ok(outcome) => {
                    debug!(
                        %name,
                        table = config.rule.key.table,
                        priority = config.rule.key.priority,
                        owner = %config.rule.key.owner,
                        ?outcome,
                        "Reconciled IPRuleConfig"
                    );
                    return Ok(outcome);
                }
                Err(e) if is_conflict(&e) && attempt < WRITE_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Flips a record to absent and clears its hash so downstream agents
    /// re-evaluate it. Returns false when the record is already absent, gone,
    /// or not ours.
    async fn mark_absent(&self, name: &str) -> Result<bool> {
        let api = k8s::Api::<IPRuleConfig>::all(self.client.clone());
        let pp = k8s::PostParams::default();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut cfg = match api.get_opt(name).await? {
                Some(cfg) => cfg,
                None => return Ok(false),
            };
            if !cfg.is_managed() || cfg.spec.state == RuleState::Absent {
                return Ok(false);
            }
            cfg.spec.state = RuleState::Absent;
            cfg.annotations_mut().remove(SPEC_HASH_ANNOTATION);
            match api.replace(name, &pp, &cfg).await {
                Ok(_) => return Ok(true),
                Err(e) if is_conflict(&e) && attempt < WRITE_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn mk_config(name: &str, hash: &str, config: &DesiredConfig) -> IPRuleConfig {
    let mut cfg = IPRuleConfig::new(
        name,
        IPRuleConfigSpec {
            table: config.rule.key.table,
            priority: config.rule.key.priority,
            service_ip: config.rule.key.owner.to_string(),
            state: RuleState::Present,
        },
    );
    decorate(&mut cfg, hash, config);
    cfg
}

fn mutate_config(cfg: &mut IPRuleConfig, hash: &str, config: &DesiredConfig) {
    cfg.spec = IPRuleConfigSpec {
        table: config.rule.key.table,
        priority: config.rule.key.priority,
        service_ip: config.rule.key.owner.to_string(),
        state: RuleState::Present,
    };
    decorate(cfg, hash, config);
    // A record resurrected from absent must shed the acks of its previous
    // cleanup round; they only mean anything while it is absent.
    let stale = cfg
        .annotations()
        .keys()
        .filter(|k| k.starts_with(k8s::config::CLEANUP_ACK_PREFIX))
        .cloned()
        .collect::<Vec<_>>();
    for key in stale {
        cfg.annotations_mut().remove(&key);
    }
}

fn decorate(cfg: &mut IPRuleConfig, hash: &str, config: &DesiredConfig) {
    cfg.labels_mut().insert(
        k8s::MANAGED_BY_LABEL.to_string(),
        k8s::MANAGED_BY_VALUE.to_string(),
    );
    cfg.annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash.to_string());
    if let Some(owner) = &config.owner {
        cfg.metadata.owner_references = Some(vec![owner.clone()]);
    }
}
