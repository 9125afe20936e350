use crate::framework::{Capabilities, CycleState, PluginResult, ScorePlugin};
use crate::plugins::default_normalize_score;
use crate::types::{HostScore, NodeInfo, WorkUnit, MAX_NODE_SCORE};
use k8s_openapi::api::core::v1::{Taint, Toleration};

const PREFER_NO_SCHEDULE: &str = "PreferNoSchedule";

/// Prefers nodes with fewer untolerated `PreferNoSchedule` taints
pub struct TaintToleration;

impl TaintToleration {
    pub const NAME: &'static str = "TaintToleration";
}

/// Whether `toleration` tolerates `taint`
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }

    let key = toleration.key.as_deref().unwrap_or("");
    match toleration.operator.as_deref().unwrap_or("Equal") {
        // An empty key with Exists matches every taint
        "Exists" => key.is_empty() || key == taint.key,
        "Equal" => {
            key == taint.key
                && toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or("")
        }
        _ => false,
    }
}

/// Tolerations of the pod that apply to `PreferNoSchedule` taints
struct PreferTolerations(Vec<Toleration>);

impl ScorePlugin for TaintToleration {
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
        let tolerations = unit
            .pod
            .spec
            .as_ref()
            .and_then(|s| s.tolerations.as_ref())
            .map(|all| {
                all.iter()
                    .filter(|t| {
                        t.effect
                            .as_deref()
                            .map_or(true, |e| e.is_empty() || e == PREFER_NO_SCHEDULE)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        state.write(Self::NAME, PreferTolerations(tolerations));
        Ok(())
    }

    /// Number of intolerable `PreferNoSchedule` taints; lower is better
    fn score(&self, state: &CycleState, _unit: &WorkUnit, node: &NodeInfo) -> PluginResult<i64> {
        let PreferTolerations(tolerations) = state.read::<PreferTolerations>(Self::NAME)?;

        let intolerable = node
            .taints()
            .iter()
            .filter(|taint| taint.effect == PREFER_NO_SCHEDULE)
            .filter(|taint| !tolerations.iter().any(|t| tolerates(t, taint)))
            .count() as i64;
        Ok(intolerable.min(MAX_NODE_SCORE))
    }

    fn normalize_score(
        &self,
        _state: &CycleState,
        _unit: &WorkUnit,
        scores: &mut [HostScore],
    ) -> PluginResult<()> {
        default_normalize_score(MAX_NODE_SCORE, true, scores);
        Ok(())
    }
}
