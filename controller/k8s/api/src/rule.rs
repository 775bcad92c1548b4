use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares which routing table and priority to use for any virtual IP that
/// falls within the given CIDR.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "iprule.dev", version = "v1alpha1", kind = "IPRule")]
#[serde(rename_all = "camelCase")]
pub struct IPRuleSpec {
    /// Subnet matched against virtual IPs, in CIDR notation.
    pub cidr: String,
    /// Target routing table. Zero selects the default table (254).
    #[serde(default)]
    pub table: u32,
    /// Rule priority. Zero lets the agent (kernel) choose.
    #[serde(default)]
    pub priority: u32,
}
