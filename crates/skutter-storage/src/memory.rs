use crate::store::{apply_binding, bound_requests, node_key, pod_key};
use crate::{Binding, ClusterStore, EventBusConfig, Result, StorageError};
use k8s_openapi::api::core::v1::{Node, Pod};
use skutter_core::{ClusterEvent, UnitKey};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Default)]
struct MemoryState {
    pods: BTreeMap<UnitKey, Pod>,
    nodes: BTreeMap<String, Node>,
    revision: u64,
}

impl MemoryState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// In-process cluster store
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    event_tx: broadcast::Sender<ClusterEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_bus_config(EventBusConfig::default())
    }

    pub fn with_event_bus_config(config: EventBusConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.capacity);
        Self {
            state: Mutex::new(MemoryState::default()),
            event_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ClusterEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl ClusterStore for MemoryStore {
    fn get_pod(&self, key: &UnitKey) -> Result<Option<Pod>> {
        Ok(self.state().pods.get(key).cloned())
    }

    fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.state().pods.values().cloned().collect())
    }

    fn put_pod(&self, mut pod: Pod) -> Result<Pod> {
        let key = pod_key(&pod)?;
        let event = {
            let mut state = self.state();
            pod.metadata.namespace = Some(key.namespace.clone());
            pod.metadata.resource_version = Some(state.next_revision());
            match state.pods.insert(key.clone(), pod.clone()) {
                Some(old) => ClusterEvent::PodUpdated {
                    old,
                    new: pod.clone(),
                },
                None => ClusterEvent::PodAdded { pod: pod.clone() },
            }
        };

        debug!("Stored pod {}", key);
        self.publish(event);
        Ok(pod)
    }

    fn delete_pod(&self, key: &UnitKey) -> Result<Option<Pod>> {
        let removed = self.state().pods.remove(key);
        if let Some(pod) = &removed {
            debug!("Deleted pod {}", key);
            self.publish(ClusterEvent::PodDeleted { pod: pod.clone() });
        }
        Ok(removed)
    }

    fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state().nodes.get(name).cloned())
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    fn put_node(&self, mut node: Node) -> Result<Node> {
        let name = node_key(&node)?;
        let event = {
            let mut state = self.state();
            node.metadata.resource_version = Some(state.next_revision());
            match state.nodes.insert(name, node.clone()) {
                Some(old) => ClusterEvent::NodeUpdated {
                    old,
                    new: node.clone(),
                },
                None => ClusterEvent::NodeAdded { node: node.clone() },
            }
        };

        self.publish(event);
        Ok(node)
    }

    fn delete_node(&self, name: &str) -> Result<Option<Node>> {
        let removed = self.state().nodes.remove(name);
        if let Some(node) = &removed {
            self.publish(ClusterEvent::NodeDeleted { node: node.clone() });
        }
        Ok(removed)
    }

    fn bind_pod(&self, binding: &Binding) -> Result<Pod> {
        let (old, bound) = {
            let mut state = self.state();
            let old = state
                .pods
                .get(&binding.key)
                .cloned()
                .ok_or_else(|| StorageError::not_found(binding.key.to_string()))?;

            let already_bound = bound_requests(state.pods.values(), &binding.node_name);
            let node = state.nodes.get(&binding.node_name);
            let mut bound = apply_binding(old.clone(), binding, node, already_bound)?;

            bound.metadata.resource_version = Some(state.next_revision());
            state.pods.insert(binding.key.clone(), bound.clone());
            (old, bound)
        };

        debug!("Bound pod {} to node {}", binding.key, binding.node_name);
        self.publish(ClusterEvent::PodUpdated {
            old,
            new: bound.clone(),
        });
        Ok(bound)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }
}
