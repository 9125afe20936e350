use crate::plugins::{node_selector_term_matches, tolerates};
use crate::types::{FilterResult, NodeInfo};
use k8s_openapi::api::core::v1::Pod;
use skutter_core::pod_requests;
use std::collections::BTreeMap;
use tracing::debug;

/// Filter predicate trait
pub trait FilterPredicate: Send + Sync {
    /// Filter a node for the given pod
    fn filter(&self, pod: &Pod, node: &NodeInfo) -> FilterResult;

    /// Name of the filter
    fn name(&self) -> &str;
}

/// Rejects cordoned nodes
pub struct NodeUnschedulable;

impl FilterPredicate for NodeUnschedulable {
    fn filter(&self, _pod: &Pod, node: &NodeInfo) -> FilterResult {
        if node.is_unschedulable() {
            return FilterResult::fail(node.name(), "node(s) were unschedulable");
        }
        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "NodeUnschedulable"
    }
}

/// Filter for pod resource requirements, against capacity not yet taken by
/// bound or assumed pods
pub struct PodFitsResources;

impl FilterPredicate for PodFitsResources {
    fn filter(&self, pod: &Pod, node: &NodeInfo) -> FilterResult {
        let requests = pod_requests(pod);
        let free = node.free();

        // Check if node has enough resources
        if requests.cpu_millicores > free.cpu_millicores {
            debug!(
                "Node {} lacks CPU: requested {} milli, free {} milli",
                node.name(),
                requests.cpu_millicores,
                free.cpu_millicores
            );
            return FilterResult::fail(node.name(), "Insufficient cpu");
        }

        if requests.memory_bytes > free.memory_bytes {
            debug!(
                "Node {} lacks memory: requested {} bytes, free {} bytes",
                node.name(),
                requests.memory_bytes,
                free.memory_bytes
            );
            return FilterResult::fail(node.name(), "Insufficient memory");
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "PodFitsResources"
    }
}

/// Filter for node selector and required node affinity
pub struct NodeSelectorMatch;

impl FilterPredicate for NodeSelectorMatch {
    fn filter(&self, pod: &Pod, node: &NodeInfo) -> FilterResult {
        const MISMATCH: &str = "node(s) didn't match Pod's node affinity/selector";

        let pod_spec = match &pod.spec {
            Some(spec) => spec,
            None => return FilterResult::pass(node.name()),
        };

        // Check if all selector labels match
        if let Some(selector) = &pod_spec.node_selector {
            let labels = node.labels();
            for (key, value) in selector {
                if labels.and_then(|l| l.get(key)) != Some(value) {
                    return FilterResult::fail(node.name(), MISMATCH);
                }
            }
        }

        // Required terms are ORed
        let required = pod_spec
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref());
        if let Some(required) = required {
            let matched = required
                .node_selector_terms
                .iter()
                .any(|term| node_selector_term_matches(term, node));
            if !matched {
                return FilterResult::fail(node.name(), MISMATCH);
            }
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "NodeSelectorMatch"
    }
}

/// Filter for NoSchedule and NoExecute taints
pub struct TaintToleration;

impl FilterPredicate for TaintToleration {
    fn filter(&self, pod: &Pod, node: &NodeInfo) -> FilterResult {
        let tolerations = pod
            .spec
            .as_ref()
            .and_then(|s| s.tolerations.as_deref())
            .unwrap_or(&[]);

        // Check if pod tolerates all hard taints
        let untolerated = node
            .taints()
            .iter()
            .filter(|taint| taint.effect == "NoSchedule" || taint.effect == "NoExecute")
            .find(|taint| !tolerations.iter().any(|t| tolerates(t, taint)));

        if let Some(taint) = untolerated {
            debug!(
                "Node {} has taint {}={} the pod does not tolerate",
                node.name(),
                taint.key,
                taint.effect
            );
            return FilterResult::fail(node.name(), "node(s) had untolerated taint");
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "TaintToleration"
    }
}

/// Get default filter predicates
pub fn default_filters() -> Vec<Box<dyn FilterPredicate>> {
    vec![
        Box::new(NodeUnschedulable),
        Box::new(PodFitsResources),
        Box::new(NodeSelectorMatch),
        Box::new(TaintToleration),
    ]
}

/// First failing result for `node`, or a pass
pub fn run_filters(filters: &[Box<dyn FilterPredicate>], pod: &Pod, node: &NodeInfo) -> FilterResult {
    filters
        .iter()
        .map(|f| f.filter(pod, node))
        .find(|r| !r.passed)
        .unwrap_or_else(|| FilterResult::pass(node.name()))
}

/// Nodes that passed every filter, plus the failures of the rest
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub feasible: Vec<NodeInfo>,
    pub failures: Vec<FilterResult>,
}

impl FilterOutcome {
    /// Human-readable summary, e.g.
    /// `0/3 nodes are available: 1 Insufficient cpu, 2 node(s) had untolerated taint.`
    pub fn message(&self) -> String {
        let total = self.feasible.len() + self.failures.len();
        if total == 0 {
            return "0/0 nodes are available: no nodes registered.".to_string();
        }

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for failure in &self.failures {
            let reason = failure.reason.as_deref().unwrap_or("unknown");
            *counts.entry(reason).or_default() += 1;
        }
        let reasons: Vec<String> = counts
            .iter()
            .map(|(reason, count)| format!("{} {}", count, reason))
            .collect();

        format!(
            "{}/{} nodes are available: {}.",
            self.feasible.len(),
            total,
            reasons.join(", ")
        )
    }
}

/// Run every filter against every node
pub fn filter_nodes(
    filters: &[Box<dyn FilterPredicate>],
    pod: &Pod,
    nodes: Vec<NodeInfo>,
) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for node in nodes {
        let result = run_filters(filters, pod, &node);
        if result.passed {
            outcome.feasible.push(node);
        } else {
            outcome.failures.push(result);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::*;
    use k8s_openapi::api::core::v1::NodeSpec;
    use skutter_core::ResourceQuantities;

    #[test]
    fn test_pod_fits_resources_pass() {
        let node = NodeInfo::new(create_test_node("node1", "4", "8Gi"));
        let pod = create_test_pod("test-pod", "1", "1Gi");

        let result = PodFitsResources.filter(&pod, &node);
        assert!(result.passed);
    }

    #[test]
    fn test_pod_fits_resources_fail_cpu() {
        let node = NodeInfo::new(create_test_node("node1", "1", "8Gi"));
        let pod = create_test_pod("test-pod", "2", "1Gi");

        let result = PodFitsResources.filter(&pod, &node);
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("Insufficient cpu"));
    }

    #[test]
    fn test_pod_fits_resources_fail_memory() {
        let node = NodeInfo::new(create_test_node("node1", "4", "1Gi"));
        let pod = create_test_pod("test-pod", "1", "2Gi");

        let result = PodFitsResources.filter(&pod, &node);
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("Insufficient memory"));
    }

    #[test]
    fn test_pod_fits_resources_counts_assumed_usage() {
        let mut node = NodeInfo::new(create_test_node("node1", "4", "8Gi"));
        node.add_usage(ResourceQuantities::new(3500, 0));
        let pod = create_test_pod("test-pod", "1", "1Gi");

        assert!(!PodFitsResources.filter(&pod, &node).passed);
    }

    #[test]
    fn test_node_selector_and_required_affinity() {
        let node = NodeInfo::new(with_labels(
            create_test_node("node1", "4", "8Gi"),
            &[("disk", "ssd"), ("zone", "a")],
        ));

        let pod = with_node_selector(create_test_pod("p", "1", "1Gi"), &[("disk", "ssd")]);
        assert!(NodeSelectorMatch.filter(&pod, &node).passed);

        let pod = with_node_selector(create_test_pod("p", "1", "1Gi"), &[("disk", "hdd")]);
        assert!(!NodeSelectorMatch.filter(&pod, &node).passed);

        let pod = with_required_affinity(create_test_pod("p", "1", "1Gi"), "zone", "In", &["b"]);
        assert!(!NodeSelectorMatch.filter(&pod, &node).passed);

        // Terms are ORed
        let pod = with_required_affinity(pod, "zone", "In", &["a"]);
        assert!(NodeSelectorMatch.filter(&pod, &node).passed);
    }

    #[test]
    fn test_taint_toleration_filter() {
        let node = NodeInfo::new(with_taint(
            create_test_node("node1", "4", "8Gi"),
            "dedicated",
            "NoSchedule",
        ));

        let pod = create_test_pod("p", "1", "1Gi");
        assert!(!TaintToleration.filter(&pod, &node).passed);

        let pod = with_toleration(pod, "dedicated", Some("NoSchedule"));
        assert!(TaintToleration.filter(&pod, &node).passed);

        // Soft taints never filter
        let soft = NodeInfo::new(with_taint(
            create_test_node("node2", "4", "8Gi"),
            "spot",
            "PreferNoSchedule",
        ));
        assert!(TaintToleration.filter(&create_test_pod("q", "1", "1Gi"), &soft).passed);
    }

    #[test]
    fn test_node_unschedulable() {
        let mut node = create_test_node("node1", "4", "8Gi");
        node.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        let result = NodeUnschedulable.filter(&create_test_pod("p", "1", "1Gi"), &NodeInfo::new(node));
        assert!(!result.passed);
    }

    #[test]
    fn test_filter_nodes_message() {
        let filters = default_filters();
        let nodes = vec![
            NodeInfo::new(create_test_node("small1", "1", "8Gi")),
            NodeInfo::new(create_test_node("small2", "1", "8Gi")),
            NodeInfo::new(with_taint(
                create_test_node("tainted", "8", "16Gi"),
                "dedicated",
                "NoSchedule",
            )),
        ];
        let pod = create_test_pod("big", "2", "1Gi");

        let outcome = filter_nodes(&filters, &pod, nodes);
        assert!(outcome.feasible.is_empty());
        assert_eq!(
            outcome.message(),
            "0/3 nodes are available: 2 Insufficient cpu, 1 node(s) had untolerated taint."
        );
    }
}
