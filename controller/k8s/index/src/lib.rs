//! The rule resolution engine.
//!
//! This crate turns the cluster's `IPRule` policies and the live virtual-IP
//! bindings of `Service` objects into the persisted `IPRuleConfig` record
//! set. It watches the following resources:
//!
//! - Each `IPRule` maps a CIDR of virtual IPs to a routing table/priority.
//! - Each `Service` contributes a binding from its clusterIP to the
//!   LoadBalancer ingress IPs it currently owns.
//!
//! ```text
//! [ IPRule ] ─┐
//!             ├─> [ Index ] ─(change signal)─> [ Controller ] ─> IPRuleConfig
//! [ Service ]─┘
//! ```
//!
//! The [`Index`] is updated by a single task per watch and recomputes the
//! desired rule set on demand; the [`Controller`] reacts to the change signal
//! (and a periodic tick) by planning and executing create/update/mark-absent
//! operations against the API, using compare-and-swap writes throughout. It
//! never deletes a record: retirement belongs to the node agents' ack
//! barrier.
//!
//! Multiple controller replicas may run; [`Activation`] picks exactly one
//! writer per pass by comparing replica pod names.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod activation;
mod controller;
mod index;
mod metrics;
mod ops;

#[cfg(test)]
mod tests;

pub use self::{
    activation::Activation,
    controller::Controller,
    index::{index_rules, index_services, DesiredConfig, Index, SharedIndex},
    metrics::ControllerMetrics,
    ops::{plan, Op},
};
