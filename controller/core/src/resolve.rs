use ahash::AHashMap as HashMap;
use ipnet::IpNet;
use std::net::IpAddr;

/// The routing table used when a policy leaves the table unset.
pub const DEFAULT_TABLE: u32 = 254;

/// A routing policy, as declared by an operator: any virtual IP falling
/// within `cidr` should be looked up in `table` with `priority`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePolicy {
    pub name: String,
    pub cidr: IpNet,
    /// Target routing table. Zero means "use [`DEFAULT_TABLE`]".
    pub table: u32,
    /// Rule priority. Zero lets the kernel pick one.
    pub priority: u32,
}

impl RoutePolicy {
    fn table(&self) -> u32 {
        if self.table == 0 {
            DEFAULT_TABLE
        } else {
            self.table
        }
    }
}

/// A derived fact: an owner address (a service's stable cluster-internal
/// address) and the externally reachable virtual IPs it currently holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VipBinding {
    pub owner: IpAddr,
    pub vips: Vec<IpAddr>,
}

/// The identity of a rule record. At most one record may exist per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub owner: IpAddr,
    pub table: u32,
    pub priority: u32,
}

/// A resolved desired rule: the key plus bookkeeping about the policy that
/// won the longest-prefix contest for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredRule {
    pub key: RuleKey,
    pub prefix_len: u8,
    pub cidr: IpNet,
    /// Name of the most specific matching policy.
    pub policy: String,
}

impl DesiredRule {
    /// Whether `self` beats `other` for the same key: longer prefix wins,
    /// ties broken by lexicographically smallest (CIDR, policy name) so the
    /// outcome never depends on iteration order.
    fn wins_over(&self, other: &Self) -> bool {
        if self.prefix_len != other.prefix_len {
            return self.prefix_len > other.prefix_len;
        }
        (self.cidr.to_string(), &self.policy) < (other.cidr.to_string(), &other.policy)
    }
}

/// Resolves policies against virtual-IP bindings into the desired rule set.
///
/// Every (owner, vip) pair is matched against every policy whose CIDR
/// contains the vip. Candidates colliding on (owner, table, priority) are
/// reduced to the most specific CIDR. Two vips of the same owner matching
/// policies with distinct (table, priority) produce two distinct records.
pub fn resolve<'p>(
    policies: impl IntoIterator<Item = &'p RoutePolicy>,
    bindings: impl IntoIterator<Item = &'p VipBinding>,
) -> HashMap<RuleKey, DesiredRule> {
    let policies = policies.into_iter().collect::<Vec<_>>();
    let mut desired = HashMap::<RuleKey, DesiredRule>::new();

    for binding in bindings {
        for vip in &binding.vips {
            for policy in &policies {
                if !policy.cidr.contains(vip) {
                    continue;
                }
                let candidate = DesiredRule {
                    key: RuleKey {
                        owner: binding.owner,
                        table: policy.table(),
                        priority: policy.priority,
                    },
                    prefix_len: policy.cidr.prefix_len(),
                    cidr: policy.cidr,
                    policy: policy.name.clone(),
                };
                match desired.entry(candidate.key) {
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(candidate);
                    }
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        if candidate.wins_over(entry.get()) {
                            entry.insert(candidate);
                        }
                    }
                }
            }
        }
    }

    desired
}
