use crate::Result;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use serde::{Deserialize, Serialize};
use skutter_core::{node_name, pod_priority, pod_requests, ResourceQuantities, UnitKey};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Upper bound of every plugin score, before and after normalization
pub const MAX_NODE_SCORE: i64 = 100;

/// Upper bound of scores returned by legacy extenders
pub const MAX_EXTENDER_PRIORITY: i64 = 10;

/// Why a scheduling attempt failed, which decides the queue transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// No node passed the constraint filters
    Infeasible,
    /// A plugin or extender hook errored
    PluginPrecondition,
    /// A plugin produced a score outside [0, MAX_NODE_SCORE]
    ScoreRangeViolation,
    /// The store rejected the binding
    CommitConflict,
    /// The scoring cycle ran past its deadline
    CycleTimeout,
    /// Anything else (store reads, bugs)
    Internal,
}

impl FailureKind {
    /// Units failing with a transient kind retry through Backoff rather than
    /// waiting in Unschedulable for a cluster change.
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Infeasible)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Infeasible => "Unschedulable",
            Self::PluginPrecondition => "PluginPrecondition",
            Self::ScoreRangeViolation => "ScoreRangeViolation",
            Self::CommitConflict => "CommitConflict",
            Self::CycleTimeout => "CycleTimeout",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// Pipeline stage that produced a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreStage {
    Raw,
    Normalized,
}

impl fmt::Display for ScoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Normalized => f.write_str("normalized"),
        }
    }
}

/// A pending pod tracked by the scheduling queue
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Unique key (namespace/name)
    pub key: UnitKey,
    /// Latest observed pod object
    pub pod: Pod,
    /// Higher is scheduled first
    pub priority: i32,
    /// When the unit was first queued
    pub enqueued_at: Instant,
    /// Enqueue order, breaks ties between units queued at the same instant
    pub(crate) seq: u64,
    /// Earliest time the unit may leave Backoff
    pub ready_at: Option<Instant>,
    /// Failed attempts so far
    pub attempts: u32,
    /// Kind of the most recent failure
    pub last_failure: Option<FailureKind>,
    /// Human-readable reason of the most recent failure
    pub last_reason: Option<String>,
    /// When the unit entered Unschedulable
    pub unschedulable_since: Option<Instant>,
    /// Scheduling cycle in which the unit was last popped
    pub cycle: u64,
}

impl WorkUnit {
    /// Wrap a pending pod
    pub fn new(pod: Pod) -> Result<Self> {
        let key = UnitKey::from_pod(&pod)?;
        Ok(Self {
            key,
            priority: pod_priority(&pod),
            pod,
            enqueued_at: Instant::now(),
            seq: 0,
            ready_at: None,
            attempts: 0,
            last_failure: None,
            last_reason: None,
            unschedulable_since: None,
            cycle: 0,
        })
    }

    /// Replace the pod payload, keeping queue bookkeeping
    pub(crate) fn refresh(&mut self, pod: Pod) {
        self.priority = pod_priority(&pod);
        self.pod = pod;
    }

    /// Resources requested by the pod
    pub fn requests(&self) -> ResourceQuantities {
        pod_requests(&self.pod)
    }
}

/// Scheduler's view of one node: the node object plus usage by bound and
/// assumed pods.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    node: Arc<Node>,
    /// Allocatable capacity
    pub allocatable: ResourceQuantities,
    /// Sum of requests of pods bound or assumed on this node
    pub requested: ResourceQuantities,
    /// Number of pods bound or assumed on this node
    pub pod_count: usize,
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        let allocatable = node
            .status
            .as_ref()
            .and_then(|s| s.allocatable.as_ref())
            .map(ResourceQuantities::from_k8s_resource_map)
            .unwrap_or_default();

        Self {
            node: Arc::new(node),
            allocatable,
            requested: ResourceQuantities::default(),
            pod_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        node_name(&self.node)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.node.metadata.labels.as_ref()
    }

    pub fn taints(&self) -> &[Taint] {
        self.node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_deref())
            .unwrap_or(&[])
    }

    pub fn is_unschedulable(&self) -> bool {
        self.node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    /// Capacity not yet requested
    pub fn free(&self) -> ResourceQuantities {
        self.allocatable.saturating_sub(self.requested)
    }

    pub(crate) fn add_usage(&mut self, requests: ResourceQuantities) {
        self.requested += requests;
        self.pod_count += 1;
    }

    pub(crate) fn remove_usage(&mut self, requests: ResourceQuantities) {
        self.requested = self.requested.saturating_sub(requests);
        self.pod_count = self.pod_count.saturating_sub(1);
    }
}

/// Result of filtering a node
#[derive(Debug, Clone)]
pub struct FilterResult {
    /// Node name
    pub node_name: String,
    /// Whether the node passed the filter
    pub passed: bool,
    /// Reason for failure (if any)
    pub reason: Option<String>,
}

impl FilterResult {
    /// Create a passing filter result
    pub fn pass(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            passed: true,
            reason: None,
        }
    }

    /// Create a failing filter result
    pub fn fail(node_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Aggregated weighted score of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostScore {
    pub host: String,
    pub total: i64,
}

impl HostScore {
    pub fn new(host: impl Into<String>, total: i64) -> Self {
        Self {
            host: host.into(),
            total,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use k8s_openapi::api::core::v1::{
        Affinity, Container, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement,
        NodeSelectorTerm, NodeSpec, NodeStatus, Pod, PodSpec, PreferredSchedulingTerm,
        ResourceRequirements, Taint, Toleration,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn resources(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        map.insert("cpu".to_string(), Quantity(cpu.to_string()));
        map.insert("memory".to_string(), Quantity(memory.to_string()));
        map
    }

    pub fn create_test_node(name: &str, cpu: &str, memory: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.status = Some(NodeStatus {
            allocatable: Some(resources(cpu, memory)),
            ..Default::default()
        });
        node
    }

    pub fn with_labels(mut node: Node, labels: &[(&str, &str)]) -> Node {
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node
    }

    pub fn with_taint(mut node: Node, key: &str, effect: &str) -> Node {
        let spec = node.spec.get_or_insert_with(NodeSpec::default);
        spec.taints.get_or_insert_with(Vec::new).push(Taint {
            key: key.to_string(),
            effect: effect.to_string(),
            ..Default::default()
        });
        node
    }

    pub fn create_test_pod(name: &str, cpu: &str, memory: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(resources(cpu, memory)),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod
    }

    pub fn with_priority(mut pod: Pod, priority: i32) -> Pod {
        if let Some(spec) = pod.spec.as_mut() {
            spec.priority = Some(priority);
        }
        pod
    }

    pub fn with_node_selector(mut pod: Pod, selector: &[(&str, &str)]) -> Pod {
        if let Some(spec) = pod.spec.as_mut() {
            spec.node_selector = Some(
                selector
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        }
        pod
    }

    pub fn with_preferred_affinity(
        mut pod: Pod,
        weight: i32,
        key: &str,
        operator: &str,
        values: &[&str],
    ) -> Pod {
        let term = PreferredSchedulingTerm {
            weight,
            preference: NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: key.to_string(),
                    operator: operator.to_string(),
                    values: Some(values.iter().map(|v| v.to_string()).collect()),
                }]),
                match_fields: None,
            },
        };
        if let Some(spec) = pod.spec.as_mut() {
            spec.affinity
                .get_or_insert_with(Affinity::default)
                .node_affinity
                .get_or_insert_with(NodeAffinity::default)
                .preferred_during_scheduling_ignored_during_execution
                .get_or_insert_with(Vec::new)
                .push(term);
        }
        pod
    }

    pub fn with_required_affinity(mut pod: Pod, key: &str, operator: &str, values: &[&str]) -> Pod {
        let term = NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: key.to_string(),
                operator: operator.to_string(),
                values: Some(values.iter().map(|v| v.to_string()).collect()),
            }]),
            match_fields: None,
        };
        if let Some(spec) = pod.spec.as_mut() {
            spec.affinity
                .get_or_insert_with(Affinity::default)
                .node_affinity
                .get_or_insert_with(NodeAffinity::default)
                .required_during_scheduling_ignored_during_execution
                .get_or_insert_with(NodeSelector::default)
                .node_selector_terms
                .push(term);
        }
        pod
    }

    pub fn with_toleration(mut pod: Pod, key: &str, effect: Option<&str>) -> Pod {
        if let Some(spec) = pod.spec.as_mut() {
            spec.tolerations.get_or_insert_with(Vec::new).push(Toleration {
                key: Some(key.to_string()),
                operator: Some("Exists".to_string()),
                effect: effect.map(str::to_string),
                ..Default::default()
            });
        }
        pod
    }
}
