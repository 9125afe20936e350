use crate::framework::{Capabilities, CycleState, PluginResult, ScorePlugin};
use crate::plugins::default_normalize_score;
use crate::types::{HostScore, NodeInfo, WorkUnit, MAX_NODE_SCORE};
use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm, Pod};

/// Prefers nodes matching the pod's preferred node affinity terms.
///
/// The raw score is the matched share of the total term weight; scores are
/// then rescaled so the best node gets `MAX_NODE_SCORE`.
pub struct NodeAffinity;

impl NodeAffinity {
    pub const NAME: &'static str = "NodeAffinity";
}

/// Preferred terms of one pod, computed once per cycle
struct PreferredTerms {
    terms: Vec<(i64, NodeSelectorTerm)>,
    total_weight: i64,
}

fn preferred_terms(pod: &Pod) -> PreferredTerms {
    let terms: Vec<(i64, NodeSelectorTerm)> = pod
        .spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.preferred_during_scheduling_ignored_during_execution.as_ref())
        .map(|preferred| {
            preferred
                .iter()
                .filter(|t| t.weight > 0)
                .map(|t| (i64::from(t.weight), t.preference.clone()))
                .collect()
        })
        .unwrap_or_default();

    let total_weight = terms.iter().map(|(w, _)| w).sum();
    PreferredTerms {
        terms,
        total_weight,
    }
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&String>) -> bool {
    let values = req.values.as_deref().unwrap_or(&[]);
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.map_or(true, |v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" | "Lt" => {
            let (Some(actual), Some(bound)) = (
                value.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|v| v.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            }
        }
        _ => false,
    }
}

/// Whether every expression and field requirement of `term` matches the
/// node. A term with no requirements matches nothing.
pub fn node_selector_term_matches(term: &NodeSelectorTerm, node: &NodeInfo) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or(&[]);
    let fields = term.match_fields.as_deref().unwrap_or(&[]);
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }

    let labels = node.labels();
    let name = node.name().to_string();

    expressions
        .iter()
        .all(|req| requirement_matches(req, labels.and_then(|l| l.get(&req.key))))
        && fields.iter().all(|req| {
            let value = (req.key == "metadata.name").then_some(&name);
            requirement_matches(req, value)
        })
}

impl ScorePlugin for NodeAffinity {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            pre_score: true,
            normalize_score: true,
        }
    }

    fn pre_score(
        &self,
        state: &mut CycleState,
        unit: &WorkUnit,
        _nodes: &[NodeInfo],
    ) -> PluginResult<()> {
        state.write(Self::NAME, preferred_terms(&unit.pod));
        Ok(())
    }

    fn score(&self, state: &CycleState, _unit: &WorkUnit, node: &NodeInfo) -> PluginResult<i64> {
        let preferred = state.read::<PreferredTerms>(Self::NAME)?;
        if preferred.total_weight == 0 {
            return Ok(0);
        }

        let matched: i64 = preferred
            .terms
            .iter()
            .filter(|(_, term)| node_selector_term_matches(term, node))
            .map(|(w, _)| w)
            .sum();
        Ok(matched * MAX_NODE_SCORE / preferred.total_weight)
    }

    fn normalize_score(
        &self,
        _state: &CycleState,
        _unit: &WorkUnit,
        scores: &mut [HostScore],
    ) -> PluginResult<()> {
        default_normalize_score(MAX_NODE_SCORE, false, scores);
        Ok(())
    }
}
