pub mod quantities;

pub use quantities::ResourceQuantities;

use k8s_openapi::api::core::v1::{Node, Pod};

/// Effective resource request of a pod.
///
/// Regular containers run together, so their requests add up. Init containers
/// run one at a time before them, so only the largest one matters.
pub fn pod_requests(pod: &Pod) -> ResourceQuantities {
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return ResourceQuantities::default(),
    };

    let container_requests = |c: &k8s_openapi::api::core::v1::Container| {
        c.resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .map(ResourceQuantities::from_k8s_resource_map)
            .unwrap_or_default()
    };

    let running = spec
        .containers
        .iter()
        .map(container_requests)
        .fold(ResourceQuantities::default(), |acc, r| acc + r);

    let init = spec
        .init_containers
        .iter()
        .flatten()
        .map(container_requests)
        .fold(ResourceQuantities::default(), ResourceQuantities::max);

    running.max(init)
}

/// Scheduling priority of a pod (`spec.priority`, default 0)
pub fn pod_priority(pod: &Pod) -> i32 {
    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
}

/// Whether the pod has already been assigned to a node
pub fn is_bound(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| !n.is_empty())
}

/// Name of a node, or "unknown" when metadata.name is missing
pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("unknown")
}
