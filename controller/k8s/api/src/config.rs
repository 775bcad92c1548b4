use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, net::IpAddr};

/// Annotation holding the content hash of the spec; a matching hash lets the
/// controller skip the write entirely.
pub const SPEC_HASH_ANNOTATION: &str = "iprule.dev/spec-hash";

/// Prefix of the per-node cleanup acknowledgment annotations set while a
/// record is absent: `cleanup-ack.iprule.dev/<node>: "done"`.
pub const CLEANUP_ACK_PREFIX: &str = "cleanup-ack.iprule.dev/";
pub const CLEANUP_ACK_DONE: &str = "done";

/// A per-owner rule record generated by the controller and consumed by every
/// node agent. Exactly one record exists per (serviceIP, table, priority).
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "iprule.dev", version = "v1alpha1", kind = "IPRuleConfig")]
#[serde(rename_all = "camelCase")]
pub struct IPRuleConfigSpec {
    pub table: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(rename = "serviceIP")]
    pub service_ip: String,
    pub state: RuleState,
}

/// Lifecycle state of a rule record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    Present,
    Absent,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Present => "present",
            RuleState::Absent => "absent",
        }
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of nodes that have confirmed local cleanup of an absent record.
///
/// On the wire this is a bag of `cleanup-ack.iprule.dev/<node>` annotations;
/// internally it is a typed set so barrier checks never grovel through raw
/// metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupAcks(BTreeSet<String>);

impl CleanupAcks {
    pub fn annotation_key(node: &str) -> String {
        format!("{}{}", CLEANUP_ACK_PREFIX, node)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.0.contains(node)
    }

    /// True when every named node has acknowledged. An empty node list is
    /// trivially covered.
    pub fn covers<'a>(&self, nodes: impl IntoIterator<Item = &'a str>) -> bool {
        nodes.into_iter().all(|n| self.0.contains(n))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for CleanupAcks {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl IPRuleConfig {
    /// Derives the deterministic record name for a (owner, table, priority)
    /// key, so upsert retries can never create duplicates and distinct keys
    /// of the same owner never collide.
    pub fn name_for(owner: &IpAddr, table: u32, priority: u32) -> String {
        format!(
            "iprc-{}-{}-{}",
            owner.to_string().replace(['.', ':'], "-"),
            table,
            priority
        )
    }

    /// Whether this record carries the managed-by marker.
    pub fn is_managed(&self) -> bool {
        self.labels().get(crate::MANAGED_BY_LABEL).map(String::as_str)
            == Some(crate::MANAGED_BY_VALUE)
    }

    /// The stored content hash, if any.
    pub fn spec_hash(&self) -> Option<&str> {
        self.annotations().get(SPEC_HASH_ANNOTATION).map(String::as_str)
    }

    /// The typed view of this record's cleanup-ack annotations.
    pub fn cleanup_acks(&self) -> CleanupAcks {
        self.annotations()
            .keys()
            .filter_map(|k| k.strip_prefix(CLEANUP_ACK_PREFIX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names_are_deterministic() {
        let v4: IpAddr = "192.168.1.10".parse().unwrap();
        assert_eq!(
            IPRuleConfig::name_for(&v4, 100, 1000),
            "iprc-192-168-1-10-100-1000"
        );

        let v6: IpAddr = "2001:db8::5".parse().unwrap();
        assert_eq!(IPRuleConfig::name_for(&v6, 254, 0), "iprc-2001-db8--5-254-0");
    }

    #[test]
    fn acks_cover_listed_nodes() {
        let acks: CleanupAcks = ["node-a", "node-b"].into_iter().collect();
        assert!(acks.contains("node-a"));
        assert!(acks.covers(["node-a", "node-b"]));
        assert!(!acks.covers(["node-a", "node-b", "node-c"]));
        // A node that left the fleet no longer gates coverage.
        assert!(acks.covers(["node-b"]));
    }

    #[test]
    fn state_round_trips_lowercase() {
        assert_eq!(serde_json::to_string(&RuleState::Present).unwrap(), "\"present\"");
        assert_eq!(
            serde_json::from_str::<RuleState>("\"absent\"").unwrap(),
            RuleState::Absent
        );
    }
}
