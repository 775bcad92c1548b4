use iprule_controller_k8s_api::{self as k8s, ListParams, Pod, ResourceExt};

/// Decides whether this controller replica is the active writer.
///
/// There is no lock service: the replica pods are listed every pass and the
/// lexicographically smallest name wins. Standby replicas keep indexing but
/// never mutate records.
pub struct Activation {
    client: k8s::Client,
    namespace: String,
    selector: String,
    name: String,
}

// === impl Activation ===

impl Activation {
    pub fn new(
        client: k8s::Client,
        namespace: impl ToString,
        selector: impl ToString,
        name: impl ToString,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            selector: selector.to_string(),
            name: name.to_string(),
        }
    }

    /// Re-lists the replica set and applies the deterministic tie-break. A
    /// listing failure aborts the pass rather than guessing.
    pub async fn is_active(&self) -> Result<bool, k8s::Error> {
        let pods = k8s::Api::<Pod>::namespaced(self.client.clone(), &self.namespace)
            .list(&ListParams::default().labels(&self.selector))
            .await?;
        let peers = pods.items.iter().map(|p| p.name_any()).collect();
        Ok(decide(&self.name, peers))
    }
}

/// Pure tie-break: the lexicographically smallest identity is active. An
/// instance absent from the listing (e.g. running out-of-cluster) still
/// participates with its own name.
pub(crate) fn decide(name: &str, mut peers: Vec<String>) -> bool {
    if !peers.iter().any(|p| p == name) {
        peers.push(name.to_string());
    }
    peers.iter().min().map(|min| min == name).unwrap_or(true)
}
