//! Kubernetes API types for the iprule controller.
//!
//! Defines the `IPRule` policy resource and the `IPRuleConfig` rule record it
//! is resolved into, along with the label and annotation vocabulary shared by
//! the controller and the node agents.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod rule;

pub use self::{
    config::{CleanupAcks, IPRuleConfig, IPRuleConfigSpec, RuleState},
    rule::{IPRule, IPRuleSpec},
};
pub use k8s_openapi::api::core::v1::{Node, Pod, Service};
pub use kube::{
    api::{
        Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Preconditions,
    },
    Client, CustomResource, Error, Resource, ResourceExt,
};

/// Label marking resources owned by this system; anything without it is
/// foreign and never mutated.
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "iprule-controller";

/// Returns a list selector matching only managed resources.
pub fn managed_params() -> ListParams {
    ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE))
}

/// Whether `err` is a 404 from the API server.
pub fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Api(ae) if ae.code == 404)
}

/// Whether `err` is an optimistic-concurrency conflict (409).
pub fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::Api(ae) if ae.code == 409)
}
