//! Scheduler-local view of nodes and their usage.
//!
//! Usage counts pods the store reports as bound plus pods this process has
//! assumed onto a node while their binding is in flight.

use crate::types::NodeInfo;
use crate::{Result, SchedulerError};
use k8s_openapi::api::core::v1::{Node, Pod};
use skutter_core::{is_bound, node_name, pod_requests, ClusterEvent, ResourceQuantities, UnitKey};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedPod {
    node: String,
    requests: ResourceQuantities,
    assumed: bool,
}

#[derive(Default)]
struct CacheState {
    nodes: HashMap<String, NodeInfo>,
    pods: HashMap<UnitKey, CachedPod>,
}

impl CacheState {
    fn add_pod_usage(&mut self, key: UnitKey, pod: CachedPod) {
        if let Some(info) = self.nodes.get_mut(&pod.node) {
            info.add_usage(pod.requests);
        }
        self.pods.insert(key, pod);
    }

    fn remove_pod_usage(&mut self, key: &UnitKey) -> Option<CachedPod> {
        let pod = self.pods.remove(key)?;
        if let Some(info) = self.nodes.get_mut(&pod.node) {
            info.remove_usage(pod.requests);
        }
        Some(pod)
    }

    fn set_node(&mut self, node: Node) {
        let name = node_name(&node).to_string();
        let mut info = NodeInfo::new(node);
        for pod in self.pods.values().filter(|p| p.node == name) {
            info.add_usage(pod.requests);
        }
        self.nodes.insert(name, info);
    }

    fn observe_bound_pod(&mut self, pod: &Pod) {
        let Ok(key) = UnitKey::from_pod(pod) else {
            return;
        };
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            return;
        };

        if let Some(existing) = self.pods.get_mut(&key) {
            if existing.node == node {
                existing.assumed = false;
                return;
            }
            warn!(
                "Pod {} was assumed on {} but is bound to {}",
                key, existing.node, node
            );
        }
        self.remove_pod_usage(&key);
        self.add_pod_usage(
            key,
            CachedPod {
                node,
                requests: pod_requests(pod),
                assumed: false,
            },
        );
    }
}

#[derive(Default)]
pub struct SchedulerCache {
    state: RwLock<CacheState>,
}

impl SchedulerCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the cache contents with the store's nodes and bound pods.
    /// Assumed pods survive so in-flight bindings stay accounted for.
    pub fn rebuild(&self, nodes: Vec<Node>, pods: &[Pod]) {
        let mut state = self.write();
        let assumed: Vec<(UnitKey, CachedPod)> = state
            .pods
            .drain()
            .filter(|(_, p)| p.assumed)
            .collect();
        state.nodes.clear();

        for node in nodes {
            state.set_node(node);
        }
        for (key, pod) in assumed {
            state.add_pod_usage(key, pod);
        }
        for pod in pods.iter().filter(|p| is_bound(p)) {
            state.observe_bound_pod(pod);
        }
        debug!(
            "Cache rebuilt with {} nodes and {} pods",
            state.nodes.len(),
            state.pods.len()
        );
    }

    /// Keep the cache in sync with a store event
    pub fn apply_event(&self, event: &ClusterEvent) {
        let mut state = self.write();
        match event {
            ClusterEvent::NodeAdded { node } | ClusterEvent::NodeUpdated { new: node, .. } => {
                state.set_node(node.clone());
            }
            ClusterEvent::NodeDeleted { node } => {
                state.nodes.remove(node_name(node));
            }
            ClusterEvent::PodAdded { pod } | ClusterEvent::PodUpdated { new: pod, .. } => {
                if is_bound(pod) {
                    state.observe_bound_pod(pod);
                }
            }
            ClusterEvent::PodDeleted { pod } => {
                if let Ok(key) = UnitKey::from_pod(pod) {
                    state.remove_pod_usage(&key);
                }
            }
        }
    }

    /// Reserve the pod's requests on `node` until the binding is confirmed
    /// or forgotten
    pub fn assume(&self, key: &UnitKey, requests: ResourceQuantities, node: &str) -> Result<()> {
        let mut state = self.write();
        if state.pods.contains_key(key) {
            return Err(SchedulerError::internal_error(format!(
                "pod {} is already in the cache",
                key
            )));
        }
        if !state.nodes.contains_key(node) {
            return Err(SchedulerError::internal_error(format!(
                "cannot assume {} on unknown node {}",
                key, node
            )));
        }

        state.add_pod_usage(
            key.clone(),
            CachedPod {
                node: node.to_string(),
                requests,
                assumed: true,
            },
        );
        Ok(())
    }

    /// Drop an assumption whose binding failed
    pub fn forget(&self, key: &UnitKey) -> bool {
        let mut state = self.write();
        if !state.pods.get(key).is_some_and(|p| p.assumed) {
            return false;
        }
        state.remove_pod_usage(key).is_some()
    }

    /// Mark an assumed pod as bound
    pub fn finish_binding(&self, key: &UnitKey) {
        if let Some(pod) = self.write().pods.get_mut(key) {
            pod.assumed = false;
        }
    }

    pub fn is_assumed(&self, key: &UnitKey) -> bool {
        self.read().pods.get(key).is_some_and(|p| p.assumed)
    }

    /// Copy of every node, sorted by name
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        let state = self.read();
        let mut nodes: Vec<NodeInfo> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub fn node(&self, name: &str) -> Option<NodeInfo> {
        self.read().nodes.get(name).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn pod_count(&self) -> usize {
        self.read().pods.len()
    }
}
