use crate::DesiredConfig;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use iprule_controller_core::{content_hash, RuleKey};
use iprule_controller_k8s_api::{IPRuleConfig, ResourceExt, RuleState};

/// A single store operation produced by a reconcile pass.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Create the record if missing, or rewrite it to the desired present
    /// spec. Skipped entirely when the stored hash already matches.
    Upsert {
        name: String,
        hash: String,
        config: DesiredConfig,
    },
    /// Transition a no-longer-desired record to absent and clear its hash.
    MarkAbsent { name: String },
}

/// Plans the Apply and Prune phases against a listing snapshot.
///
/// Re-running with unchanged inputs yields no operations: a record whose
/// stored hash equals the computed present-hash is left untouched, and
/// records already absent stay with the agents' barrier. The plan never
/// contains a delete.
pub fn plan(desired: &HashMap<RuleKey, DesiredConfig>, existing: &[IPRuleConfig]) -> Vec<Op> {
    let by_name = existing
        .iter()
        .map(|cfg| (cfg.name_any(), cfg))
        .collect::<HashMap<_, _>>();

    let mut ops = Vec::new();
    let mut desired_names = HashSet::with_capacity(desired.len());

    for (key, config) in desired {
        let name = IPRuleConfig::name_for(&key.owner, key.table, key.priority);
        let hash = content_hash(key, RuleState::Present.as_str());
        let unchanged = by_name.get(name.as_str()).is_some_and(|cfg| {
            cfg.spec.state == RuleState::Present && cfg.spec_hash() == Some(hash.as_str())
        });
        desired_names.insert(name.clone());
        if !unchanged {
            ops.push(Op::Upsert {
                name,
                hash,
                config: config.clone(),
            });
        }
    }

    // Prune: managed records whose key is no longer desired. The record name
    // encodes the key, so the name set is the key set.
    for cfg in existing {
        if !cfg.is_managed() || cfg.spec.state == RuleState::Absent {
            continue;
        }
        let name = cfg.name_any();
        if !desired_names.contains(&name) {
            ops.push(Op::MarkAbsent { name });
        }
    }

    ops
}
