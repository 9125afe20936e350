use crate::{Result, StorageError};
use k8s_openapi::api::core::v1::{Node, Pod};
use skutter_core::{is_bound, pod_requests, ClusterEvent, ResourceQuantities, UnitKey};
use tokio::sync::broadcast;

/// Configuration for the store's change feed
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the broadcast channel
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Request to assign a pending pod to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Pod being bound
    pub key: UnitKey,
    /// Target node
    pub node_name: String,
    /// Resource version the decision was based on; `None` skips the check
    pub expected_version: Option<String>,
}

impl Binding {
    pub fn new(key: UnitKey, node_name: impl Into<String>) -> Self {
        Self {
            key,
            node_name: node_name.into(),
            expected_version: None,
        }
    }

    pub fn with_expected_version(mut self, version: Option<String>) -> Self {
        self.expected_version = version;
        self
    }
}

/// Authoritative source of pod and node state.
///
/// Every successful mutation bumps the store-wide revision, stamps it into
/// `metadata.resourceVersion` and publishes a [`ClusterEvent`].
pub trait ClusterStore: Send + Sync {
    /// Get a pod by key
    fn get_pod(&self, key: &UnitKey) -> Result<Option<Pod>>;

    /// List all pods
    fn list_pods(&self) -> Result<Vec<Pod>>;

    /// Create or replace a pod
    fn put_pod(&self, pod: Pod) -> Result<Pod>;

    /// Delete a pod, returning it if it existed
    fn delete_pod(&self, key: &UnitKey) -> Result<Option<Pod>>;

    /// Get a node by name
    fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// List all nodes
    fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Create or replace a node
    fn put_node(&self, node: Node) -> Result<Node>;

    /// Delete a node, returning it if it existed
    fn delete_node(&self, name: &str) -> Result<Option<Node>>;

    /// Durably assign a pod to a node.
    ///
    /// Fails with [`StorageError::Conflict`] when the pod is already bound, the
    /// expected version is stale, the node is gone, or the node can no longer
    /// fit the pod alongside the pods already bound to it.
    fn bind_pod(&self, binding: &Binding) -> Result<Pod>;

    /// Subscribe to mutation events
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;

    /// List pods that have not been assigned a node yet
    fn list_pending_pods(&self) -> Result<Vec<Pod>> {
        Ok(self
            .list_pods()?
            .into_iter()
            .filter(|p| !is_bound(p))
            .collect())
    }
}

/// Key of a pod, rejecting pods without a name
pub(crate) fn pod_key(pod: &Pod) -> Result<UnitKey> {
    UnitKey::from_pod(pod).map_err(|e| StorageError::invalid_object(e.to_string()))
}

/// Name of a node, rejecting nodes without one
pub(crate) fn node_key(node: &Node) -> Result<String> {
    node.metadata
        .name
        .clone()
        .ok_or_else(|| StorageError::invalid_object("node has no metadata.name"))
}

/// Sum of requests of pods already bound to `node_name`
pub(crate) fn bound_requests<'a>(
    pods: impl IntoIterator<Item = &'a Pod>,
    node_name: &str,
) -> ResourceQuantities {
    pods.into_iter()
        .filter(|p| {
            p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
        })
        .map(pod_requests)
        .fold(ResourceQuantities::default(), |acc, r| acc + r)
}

/// Check a binding against current state and return the bound pod
pub(crate) fn apply_binding(
    mut pod: Pod,
    binding: &Binding,
    node: Option<&Node>,
    already_bound: ResourceQuantities,
) -> Result<Pod> {
    let key = binding.key.to_string();

    if let Some(current) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
        if !current.is_empty() {
            return Err(StorageError::conflict(
                key,
                format!("pod is already bound to {}", current),
            ));
        }
    }

    if let Some(expected) = &binding.expected_version {
        if pod.metadata.resource_version.as_ref() != Some(expected) {
            return Err(StorageError::conflict(
                key,
                format!(
                    "stale resource version: expected {}, found {}",
                    expected,
                    pod.metadata.resource_version.as_deref().unwrap_or("<none>")
                ),
            ));
        }
    }

    let node = node.ok_or_else(|| {
        StorageError::conflict(key.clone(), format!("node {} no longer exists", binding.node_name))
    })?;

    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .map(ResourceQuantities::from_k8s_resource_map)
        .unwrap_or_default();
    let requested = already_bound + pod_requests(&pod);

    if !requested.fits_within(&allocatable) {
        return Err(StorageError::conflict(
            key,
            format!(
                "node {} cannot fit pod: would use {}m CPU / {} bytes of {}m / {} bytes",
                binding.node_name,
                requested.cpu_millicores,
                requested.memory_bytes,
                allocatable.cpu_millicores,
                allocatable.memory_bytes
            ),
        ));
    }

    match pod.spec.as_mut() {
        Some(spec) => spec.node_name = Some(binding.node_name.clone()),
        None => return Err(StorageError::invalid_object(format!("pod {} has no spec", key))),
    }

    Ok(pod)
}
