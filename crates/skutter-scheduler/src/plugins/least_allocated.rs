use crate::framework::{CycleState, PluginResult, ScorePlugin};
use crate::types::{NodeInfo, WorkUnit, MAX_NODE_SCORE};
use tracing::trace;

/// Score based on least allocated resources.
///
/// Prefers nodes with the most capacity left after placing the pod,
/// averaging CPU and memory.
pub struct LeastAllocated;

impl LeastAllocated {
    pub const NAME: &'static str = "LeastAllocated";
}

/// Share of `capacity` left after `requested` is taken, scaled to
/// `[0, MAX_NODE_SCORE]`
fn unused_score(requested: i64, capacity: i64) -> i64 {
    if capacity <= 0 || requested > capacity {
        return 0;
    }
    // Widened so capacities near i64::MAX cannot overflow the multiplication
    let unused = i128::from(capacity - requested) * i128::from(MAX_NODE_SCORE);
    (unused / i128::from(capacity)) as i64
}

impl ScorePlugin for LeastAllocated {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, _state: &CycleState, unit: &WorkUnit, node: &NodeInfo) -> PluginResult<i64> {
        let allocatable = node.allocatable;

        // If node has no resources, score 0
        if allocatable.is_zero() {
            return Ok(0);
        }

        let after = node.requested + unit.requests();
        let cpu = unused_score(after.cpu_millicores, allocatable.cpu_millicores);
        let memory = unused_score(after.memory_bytes, allocatable.memory_bytes);
        let score = (cpu + memory) / 2;

        trace!(
            "Node {} least allocated score: {} (CPU: {}, memory: {})",
            node.name(),
            score,
            cpu,
            memory
        );
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{create_test_node, create_test_pod};
    use skutter_core::ResourceQuantities;

    #[test]
    fn test_least_allocated_prefers_empty_nodes() {
        let unit = WorkUnit::new(create_test_pod("web", "1", "2Gi")).unwrap();
        let empty = NodeInfo::new(create_test_node("node1", "4", "8Gi"));
        let mut busy = NodeInfo::new(create_test_node("node2", "4", "8Gi"));
        busy.add_usage(ResourceQuantities::new(2000, 4 << 30));

        let state = CycleState::new();
        let empty_score = LeastAllocated.score(&state, &unit, &empty).unwrap();
        let busy_score = LeastAllocated.score(&state, &unit, &busy).unwrap();

        // 3/4 CPU and 6/8 memory left
        assert_eq!(empty_score, 75);
        // 1/4 CPU and 2/8 memory left
        assert_eq!(busy_score, 25);
    }

    #[test]
    fn test_least_allocated_overcommitted_node_scores_zero() {
        let unit = WorkUnit::new(create_test_pod("web", "8", "16Gi")).unwrap();
        let node = NodeInfo::new(create_test_node("node1", "4", "8Gi"));
        assert_eq!(LeastAllocated.score(&CycleState::new(), &unit, &node).unwrap(), 0);
    }

    #[test]
    fn test_least_allocated_huge_capacity() {
        let unit = WorkUnit::new(create_test_pod("web", "1", "1Gi")).unwrap();
        let node = NodeInfo::new(create_test_node("node1", "4", "9000000000G"));

        // CPU 75, memory 99
        assert_eq!(LeastAllocated.score(&CycleState::new(), &unit, &node).unwrap(), 87);
    }
}
