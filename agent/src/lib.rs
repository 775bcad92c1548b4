//! The per-node agent.
//!
//! Every node runs one agent. On a fixed interval it dumps the kernel's
//! policy-routing rules once, lists the managed `IPRuleConfig` records, and
//! converges the kernel toward them: present records get their rule added,
//! absent records get their rule removed. Once an absent record's rule is
//! gone locally, the agent participates in the cluster-wide acknowledgment
//! barrier that retires the record for good.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod metrics;
pub mod rules;
pub mod sync;

pub use self::{args::Args, metrics::AgentMetrics};
