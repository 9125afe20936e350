use crate::framework::{CycleState, PluginResult, ScorePlugin};
use crate::types::{NodeInfo, WorkUnit, MAX_NODE_SCORE};
use tracing::trace;

/// Score based on balanced resource allocation.
///
/// Prefers nodes whose CPU and memory utilization stay close to each other
/// once the pod is placed.
pub struct BalancedAllocation;

impl BalancedAllocation {
    pub const NAME: &'static str = "BalancedAllocation";
}

fn fraction(requested: i64, capacity: i64) -> f64 {
    (requested as f64 / capacity as f64).min(1.0)
}

impl ScorePlugin for BalancedAllocation {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, _state: &CycleState, unit: &WorkUnit, node: &NodeInfo) -> PluginResult<i64> {
        let allocatable = node.allocatable;
        if allocatable.cpu_millicores <= 0 || allocatable.memory_bytes <= 0 {
            return Ok(0);
        }

        // Utilization after scheduling
        let after = node.requested + unit.requests();
        let cpu_fraction = fraction(after.cpu_millicores, allocatable.cpu_millicores);
        let memory_fraction = fraction(after.memory_bytes, allocatable.memory_bytes);

        let variance = (cpu_fraction - memory_fraction).abs();
        let score = ((1.0 - variance) * MAX_NODE_SCORE as f64) as i64;

        trace!(
            "Node {} balanced allocation score: {} (variance: {:.3})",
            node.name(),
            score,
            variance
        );
        Ok(score)
    }
}
