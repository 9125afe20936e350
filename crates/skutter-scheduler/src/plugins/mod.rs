//! Built-in score plugins

mod balanced_allocation;
mod least_allocated;
mod node_affinity;
mod taint_toleration;

pub use balanced_allocation::BalancedAllocation;
pub use least_allocated::LeastAllocated;
pub use node_affinity::{node_selector_term_matches, NodeAffinity};
pub use taint_toleration::{tolerates, TaintToleration};

use crate::framework::ScorePlugin;
use crate::types::HostScore;
use std::sync::Arc;

/// Names accepted in the profile configuration
pub const NAMES: &[&str] = &[
    LeastAllocated::NAME,
    BalancedAllocation::NAME,
    NodeAffinity::NAME,
    TaintToleration::NAME,
];

/// Instantiate a built-in plugin
pub fn by_name(name: &str) -> Option<Arc<dyn ScorePlugin>> {
    let plugin: Arc<dyn ScorePlugin> = match name {
        LeastAllocated::NAME => Arc::new(LeastAllocated),
        BalancedAllocation::NAME => Arc::new(BalancedAllocation),
        NodeAffinity::NAME => Arc::new(NodeAffinity),
        TaintToleration::NAME => Arc::new(TaintToleration),
        _ => return None,
    };
    Some(plugin)
}

/// Scale scores so the highest becomes `max`. With `reverse` the result is
/// subtracted from `max`, so the lowest raw score ranks best.
///
/// If every score is zero they all become 0, or `max` when reversed.
pub fn default_normalize_score(max: i64, reverse: bool, scores: &mut [HostScore]) {
    let highest = scores.iter().map(|s| s.total).max().unwrap_or(0);

    if highest == 0 {
        if reverse {
            for s in scores.iter_mut() {
                s.total = max;
            }
        }
        return;
    }

    for s in scores.iter_mut() {
        let scaled = max * s.total / highest;
        s.total = if reverse { max - scaled } else { scaled };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_NODE_SCORE;

    fn scores(values: &[i64]) -> Vec<HostScore> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| HostScore::new(format!("n{}", i), *v))
            .collect()
    }

    fn totals(scores: &[HostScore]) -> Vec<i64> {
        scores.iter().map(|s| s.total).collect()
    }

    #[test]
    fn test_default_normalize() {
        let mut s = scores(&[10, 5, 0]);
        default_normalize_score(MAX_NODE_SCORE, false, &mut s);
        assert_eq!(totals(&s), vec![100, 50, 0]);

        let mut s = scores(&[10, 5, 0]);
        default_normalize_score(MAX_NODE_SCORE, true, &mut s);
        assert_eq!(totals(&s), vec![0, 50, 100]);
    }

    #[test]
    fn test_default_normalize_all_zero() {
        let mut s = scores(&[0, 0]);
        default_normalize_score(MAX_NODE_SCORE, false, &mut s);
        assert_eq!(totals(&s), vec![0, 0]);

        default_normalize_score(MAX_NODE_SCORE, true, &mut s);
        assert_eq!(totals(&s), vec![100, 100]);
    }

    #[test]
    fn test_registry() {
        for name in NAMES {
            assert_eq!(by_name(name).unwrap().name(), *name);
        }
        assert!(by_name("VolumeBinding").is_none());
    }
}
