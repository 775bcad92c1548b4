//! The kernel rule store adapter.
//!
//! Reads and mutates host-scope policy-routing rules through rtnetlink. Only
//! host-mask rules (/32, /128) are surfaced: anything wider belongs to
//! unrelated infrastructure and is never touched. The kernel assigns its own
//! priority when none is requested, so the index built from a dump answers
//! both exact and priority-agnostic lookups, and deletion falls back to an
//! unqualified attempt when the qualified one misses.

use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use futures::TryStreamExt;
use iprule_controller_core::retry::Recoverable;
use netlink_packet_route::{
    rule::{RuleAction, RuleAttribute, RuleMessage},
    AddressFamily,
};
use rtnetlink::{Handle, IpVersion};
use std::net::IpAddr;
use tracing::trace;

const EEXIST: i32 = 17;
const ENOENT: i32 = 2;
const EINVAL: i32 = 22;

/// A host-scope policy-routing rule as read from the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostRule {
    pub src: IpAddr,
    pub table: u32,
    /// Kernel-assigned when not requested at creation; zero when the kernel
    /// reports none.
    pub priority: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The kernel already holds an identical rule.
    #[error("rule already exists")]
    Exists,

    /// No rule matched the deletion request.
    #[error("no matching rule")]
    NotFound,

    /// The request itself is malformed; retrying cannot help.
    #[error("invalid rule: {0}")]
    Invalid(String),

    #[error("netlink request failed: {0}")]
    Netlink(#[source] rtnetlink::Error),
}

impl RuleError {
    fn from_netlink(err: rtnetlink::Error) -> Self {
        if let rtnetlink::Error::NetlinkError(ref msg) = err {
            match -msg.raw_code() {
                EEXIST => return RuleError::Exists,
                ENOENT => return RuleError::NotFound,
                EINVAL => return RuleError::Invalid("kernel rejected the request".into()),
                _ => {}
            }
        }
        RuleError::Netlink(err)
    }
}

impl Recoverable for RuleError {
    fn is_permanent(&self) -> bool {
        matches!(self, RuleError::Invalid(_))
    }
}

/// Idempotent access to the node's policy-routing rules.
#[async_trait]
pub trait RuleStore {
    /// Dumps all host-mask rules.
    async fn list(&self) -> Result<Vec<HostRule>, RuleError>;

    /// Adds a rule; an already-present identical rule is success. A zero
    /// priority leaves the choice to the kernel.
    async fn add(&self, src: IpAddr, table: u32, priority: u32) -> Result<(), RuleError>;

    /// Removes a single rule. `None` leaves the priority unspecified so the
    /// kernel matches regardless of what it assigned.
    async fn del_exact(
        &self,
        src: IpAddr,
        table: u32,
        priority: Option<u32>,
    ) -> Result<(), RuleError>;

    /// Removes a rule, trying the recorded priority first and falling back
    /// to an unqualified delete: the kernel may have stored the rule under a
    /// self-assigned priority. A rule that is already gone is success.
    async fn delete(&self, src: IpAddr, table: u32, priority: u32) -> Result<(), RuleError> {
        if priority > 0 {
            match self.del_exact(src, table, Some(priority)).await {
                Ok(()) => return Ok(()),
                // Fall through: the rule may exist under another priority.
                Err(error) => trace!(%src, table, priority, %error, "Qualified delete missed"),
            }
        }
        match self.del_exact(src, table, None).await {
            Ok(()) => Ok(()),
            Err(RuleError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A queryable snapshot of the kernel's host-mask rules, built once per pass.
#[derive(Debug, Default)]
pub struct RuleIndex {
    exact: HashSet<(IpAddr, u32, u32)>,
    wildcard: HashSet<(IpAddr, u32)>,
    len: usize,
}

// === impl RuleIndex ===

impl RuleIndex {
    pub fn from_rules(rules: impl IntoIterator<Item = HostRule>) -> Self {
        let mut idx = Self::default();
        for rule in rules {
            idx.exact.insert((rule.src, rule.table, rule.priority));
            idx.wildcard.insert((rule.src, rule.table));
            idx.len += 1;
        }
        idx
    }

    /// Presence check: exact when the record pinned a priority, otherwise
    /// priority-agnostic, since re-deriving presence must not depend on the
    /// kernel round-tripping a priority it chose itself.
    pub fn contains(&self, src: IpAddr, table: u32, priority: u32) -> bool {
        if priority > 0 {
            self.exact.contains(&(src, table, priority))
        } else {
            self.wildcard.contains(&(src, table))
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Extracts a host-mask rule from a kernel dump entry. Rules without a
/// source, and rules with a wider-than-host mask, are foreign: `None`.
pub fn host_rule(msg: &RuleMessage) -> Option<HostRule> {
    let mut src = None;
    let mut table = None;
    let mut priority = 0;
    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Source(ip) => src = Some(*ip),
            RuleAttribute::Table(t) => table = Some(*t),
            RuleAttribute::Priority(p) => priority = *p,
            _ => {}
        }
    }

    let src = src?;
    let host = match (msg.header.family, src) {
        (AddressFamily::Inet, IpAddr::V4(_)) => msg.header.src_len == 32,
        (AddressFamily::Inet6, IpAddr::V6(_)) => msg.header.src_len == 128,
        _ => false,
    };
    if !host {
        return None;
    }

    Some(HostRule {
        src,
        table: table.unwrap_or(msg.header.table as u32),
        priority,
    })
}

/// The production rule store, backed by an rtnetlink handle.
#[derive(Clone)]
pub struct NetlinkRules {
    handle: Handle,
}

// === impl NetlinkRules ===

impl NetlinkRules {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn mk_message(src: IpAddr, table: u32, priority: Option<u32>) -> RuleMessage {
        let mut msg = RuleMessage::default();
        msg.header.family = match src {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        };
        msg.header.src_len = if src.is_ipv4() { 32 } else { 128 };
        msg.header.action = RuleAction::ToTable;
        if table <= 255 {
            msg.header.table = table as u8;
        }
        msg.attributes.push(RuleAttribute::Source(src));
        msg.attributes.push(RuleAttribute::Table(table));
        if let Some(p) = priority {
            msg.attributes.push(RuleAttribute::Priority(p));
        }
        msg
    }
}

#[async_trait]
impl RuleStore for NetlinkRules {
    async fn list(&self) -> Result<Vec<HostRule>, RuleError> {
        let mut rules = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut dump = self.handle.rule().get(version).execute();
            while let Some(msg) = dump.try_next().await.map_err(RuleError::from_netlink)? {
                rules.extend(host_rule(&msg));
            }
        }
        Ok(rules)
    }

    async fn add(&self, src: IpAddr, table: u32, priority: u32) -> Result<(), RuleError> {
        let req = self
            .handle
            .rule()
            .add()
            .action(RuleAction::ToTable)
            .table_id(table);
        let res = match src {
            IpAddr::V4(ip) => {
                let mut req = req.v4().source_prefix(ip, 32);
                if priority > 0 {
                    req = req.priority(priority);
                }
                req.execute().await
            }
            IpAddr::V6(ip) => {
                let mut req = req.v6().source_prefix(ip, 128);
                if priority > 0 {
                    req = req.priority(priority);
                }
                req.execute().await
            }
        };
        match res.map_err(RuleError::from_netlink) {
            Ok(()) | Err(RuleError::Exists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn del_exact(
        &self,
        src: IpAddr,
        table: u32,
        priority: Option<u32>,
    ) -> Result<(), RuleError> {
        self.handle
            .rule()
            .del(Self::mk_message(src, table, priority))
            .execute()
            .await
            .map_err(RuleError::from_netlink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn mk_kernel_rule(family: AddressFamily, src_len: u8, attrs: Vec<RuleAttribute>) -> RuleMessage {
        let mut msg = RuleMessage::default();
        msg.header.family = family;
        msg.header.src_len = src_len;
        msg.attributes = attrs;
        msg
    }

    #[test]
    fn host_rule_accepts_host_masks_only() {
        let ok = mk_kernel_rule(
            AddressFamily::Inet,
            32,
            vec![
                RuleAttribute::Source(v4("10.0.0.5")),
                RuleAttribute::Table(100),
                RuleAttribute::Priority(1000),
            ],
        );
        assert_eq!(
            host_rule(&ok),
            Some(HostRule {
                src: v4("10.0.0.5"),
                table: 100,
                priority: 1000,
            })
        );

        // A /24 belongs to someone else entirely.
        let foreign = mk_kernel_rule(
            AddressFamily::Inet,
            24,
            vec![RuleAttribute::Source(v4("10.0.0.0")), RuleAttribute::Table(100)],
        );
        assert_eq!(host_rule(&foreign), None);
    }

    #[test]
    fn host_rule_requires_a_source() {
        let msg = mk_kernel_rule(AddressFamily::Inet, 32, vec![RuleAttribute::Table(254)]);
        assert_eq!(host_rule(&msg), None);
    }

    #[test]
    fn host_rule_accepts_v6_host_masks() {
        let msg = mk_kernel_rule(
            AddressFamily::Inet6,
            128,
            vec![
                RuleAttribute::Source("2001:db8::5".parse().unwrap()),
                RuleAttribute::Table(200),
            ],
        );
        let rule = host_rule(&msg).unwrap();
        assert_eq!(rule.table, 200);
        assert_eq!(rule.priority, 0);
    }

    #[test]
    fn host_rule_falls_back_to_header_table() {
        let mut msg = mk_kernel_rule(
            AddressFamily::Inet,
            32,
            vec![RuleAttribute::Source(v4("10.0.0.5"))],
        );
        msg.header.table = 254;
        assert_eq!(host_rule(&msg).unwrap().table, 254);
    }

    #[test]
    fn index_exact_and_wildcard_lookups() {
        let idx = RuleIndex::from_rules([HostRule {
            src: v4("192.168.1.10"),
            table: 100,
            priority: 32765, // kernel-assigned
        }]);

        // A record that pinned no priority still sees the rule.
        assert!(idx.contains(v4("192.168.1.10"), 100, 0));
        // A record that pinned the exact priority sees it too.
        assert!(idx.contains(v4("192.168.1.10"), 100, 32765));
        // A record pinning a different priority does not.
        assert!(!idx.contains(v4("192.168.1.10"), 100, 1000));
        // Other tables are invisible.
        assert!(!idx.contains(v4("192.168.1.10"), 200, 0));
    }

    #[test]
    fn index_len_counts_rules() {
        let idx = RuleIndex::from_rules([
            HostRule {
                src: v4("10.0.0.1"),
                table: 100,
                priority: 1,
            },
            HostRule {
                src: v4("10.0.0.2"),
                table: 100,
                priority: 2,
            },
        ]);
        assert_eq!(idx.len(), 2);
        assert!(!idx.is_empty());
    }

    #[test]
    fn invalid_is_permanent_for_retry() {
        assert!(RuleError::Invalid("bad".into()).is_permanent());
        assert!(!RuleError::NotFound.is_permanent());
    }
}
