//! Core types and algorithms for source-IP policy routing.
//!
//! This crate is deliberately free of Kubernetes dependencies: it holds the
//! pure pieces of the system — resolving policies and virtual-IP bindings
//! into a deduplicated desired rule set, hashing rule content so that writes
//! can be skipped when nothing changed, and the bounded-backoff retry
//! executor used for kernel mutations.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod hash;
mod resolve;
pub mod retry;

pub use self::{
    hash::content_hash,
    resolve::{resolve, DesiredRule, RoutePolicy, RuleKey, VipBinding, DEFAULT_TABLE},
};
pub use ipnet::IpNet;
