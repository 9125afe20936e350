//! Weighted multi-plugin host selection for one unit.
//!
//! The pipeline runs PreScore, Score, NormalizeScore and weighted aggregation
//! over the feasible nodes, then picks the best total with a uniform random
//! tie-break. Any failure aborts the cycle; partial scores are discarded.

use crate::config::EngineConfig;
use crate::framework::{CycleState, PluginDescriptor, Profile};
use crate::parallel::Parallelizer;
use crate::types::{
    HostScore, NodeInfo, ScoreStage, WorkUnit, MAX_EXTENDER_PRIORITY, MAX_NODE_SCORE,
};
use crate::{Result, SchedulerError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Scores returned by one extender, keyed by node name, in
/// `[0, MAX_EXTENDER_PRIORITY]`
#[derive(Debug, Clone, Default)]
pub struct ExtenderScores {
    pub extender: String,
    pub weight: u32,
    pub scores: HashMap<String, i64>,
}

/// Per-plugin detail of one cycle
#[derive(Debug, Clone, Serialize)]
pub struct PluginReport {
    pub plugin: String,
    pub weight: u32,
    pub pre_score_us: Option<u64>,
    pub score_us: u64,
    pub normalize_us: Option<u64>,
    pub raw: Vec<HostScore>,
    pub normalized: Vec<HostScore>,
}

/// Everything the engine computed for one unit
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreReport {
    pub plugins: Vec<PluginReport>,
    pub totals: Vec<HostScore>,
}

/// Outcome of a successful cycle
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    pub host: String,
    pub total: i64,
    /// Number of feasible nodes scored
    pub evaluated: usize,
    pub report: ScoreReport,
}

pub struct DecisionEngine {
    profile: Arc<Profile>,
    parallelizer: Parallelizer,
    cycle_timeout: Duration,
    rng: Mutex<StdRng>,
}

impl DecisionEngine {
    pub fn new(profile: Arc<Profile>, config: &EngineConfig) -> Result<Self> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        Ok(Self {
            profile,
            parallelizer: Parallelizer::new(config.parallelism)?,
            cycle_timeout: config.cycle_timeout,
            rng: Mutex::new(rng),
        })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Pick a node for `unit` among the feasible `nodes`
    pub fn schedule(
        &self,
        unit: &WorkUnit,
        nodes: &[NodeInfo],
        extenders: &[ExtenderScores],
    ) -> Result<ScheduleResult> {
        if nodes.is_empty() {
            return Err(SchedulerError::no_feasible_hosts(
                unit.key.to_string(),
                "no nodes to score",
            ));
        }

        let started = Instant::now();
        let deadline = started + self.cycle_timeout;
        let plugins = self.profile.plugins();
        let mut state = CycleState::new();
        let mut reports: Vec<PluginReport> = plugins
            .iter()
            .map(|d| PluginReport {
                plugin: d.name().to_string(),
                weight: d.weight,
                pre_score_us: None,
                score_us: 0,
                normalize_us: None,
                raw: Vec::new(),
                normalized: Vec::new(),
            })
            .collect();

        // PreScore
        for (descriptor, report) in plugins.iter().zip(reports.iter_mut()) {
            if !descriptor.capabilities.pre_score {
                continue;
            }
            let t = Instant::now();
            descriptor
                .plugin
                .pre_score(&mut state, unit, nodes)
                .map_err(|e| {
                    error!("PreScore of {} failed for {}: {}", descriptor.name(), unit.key, e);
                    SchedulerError::PreScoreFailed {
                        plugin: descriptor.name().to_string(),
                        message: e.message,
                    }
                })?;
            report.pre_score_us = Some(micros(t.elapsed()));
            check_deadline(started, deadline)?;
        }

        // Score
        for (descriptor, report) in plugins.iter().zip(reports.iter_mut()) {
            let t = Instant::now();
            report.raw = self.score_plugin(descriptor, &state, unit, nodes, started, deadline)?;
            report.score_us = micros(t.elapsed());
        }
        check_deadline(started, deadline)?;

        // NormalizeScore
        for (descriptor, report) in plugins.iter().zip(reports.iter_mut()) {
            let mut scores = report.raw.clone();
            if descriptor.capabilities.normalize_score {
                let t = Instant::now();
                descriptor
                    .plugin
                    .normalize_score(&state, unit, &mut scores)
                    .map_err(|e| {
                        error!(
                            "NormalizeScore of {} failed for {}: {}",
                            descriptor.name(),
                            unit.key,
                            e
                        );
                        SchedulerError::NormalizeFailed {
                            plugin: descriptor.name().to_string(),
                            message: e.message,
                        }
                    })?;
                report.normalize_us = Some(micros(t.elapsed()));

                if scores.len() != nodes.len() {
                    return Err(SchedulerError::NormalizeFailed {
                        plugin: descriptor.name().to_string(),
                        message: format!(
                            "returned {} scores for {} nodes",
                            scores.len(),
                            nodes.len()
                        ),
                    });
                }
                for score in &scores {
                    check_range(descriptor.name(), score, ScoreStage::Normalized)?;
                }
            }
            report.normalized = scores;
        }
        check_deadline(started, deadline)?;

        let totals = aggregate(nodes, &reports, extenders);
        let selected = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            select_host(&totals, &mut *rng).cloned()
        };
        let selected = selected.ok_or_else(|| {
            SchedulerError::internal_error(format!("no host selected for {}", unit.key))
        })?;

        debug!(
            "Selected node {} for {} with score {} among {} nodes in {:?}",
            selected.host,
            unit.key,
            selected.total,
            nodes.len(),
            started.elapsed()
        );

        Ok(ScheduleResult {
            host: selected.host,
            total: selected.total,
            evaluated: nodes.len(),
            report: ScoreReport {
                plugins: reports,
                totals,
            },
        })
    }

    fn score_plugin(
        &self,
        descriptor: &PluginDescriptor,
        state: &CycleState,
        unit: &WorkUnit,
        nodes: &[NodeInfo],
        started: Instant,
        deadline: Instant,
    ) -> Result<Vec<HostScore>> {
        self.parallelizer.map(nodes, |node| {
            check_deadline(started, deadline)?;

            let score = descriptor
                .plugin
                .score(state, unit, node)
                .map_err(|e| {
                    error!(
                        "Score of {} failed for {} on {}: {}",
                        descriptor.name(),
                        unit.key,
                        node.name(),
                        e
                    );
                    SchedulerError::ScoreFailed {
                        plugin: descriptor.name().to_string(),
                        host: node.name().to_string(),
                        message: e.message,
                    }
                })?;

            let score = HostScore::new(node.name(), score);
            check_range(descriptor.name(), &score, ScoreStage::Raw)?;
            Ok(score)
        })
    }
}

/// `total[h] = sum(normalized[p][h] * weight[p])`, plus every extender's
/// score rescaled to `[0, MAX_NODE_SCORE]` and weighted
fn aggregate(
    nodes: &[NodeInfo],
    reports: &[PluginReport],
    extenders: &[ExtenderScores],
) -> Vec<HostScore> {
    let scale = MAX_NODE_SCORE / MAX_EXTENDER_PRIORITY;

    nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let mut total: i64 = reports
                .iter()
                .map(|r| r.normalized[i].total * i64::from(r.weight))
                .sum();
            for extender in extenders {
                if let Some(score) = extender.scores.get(node.name()) {
                    total += score * scale * i64::from(extender.weight);
                }
            }
            HostScore::new(node.name(), total)
        })
        .collect()
}

/// Single-pass reservoir selection of a maximum. With `k` hosts tied for
/// the best total each is returned with probability `1/k`.
pub fn select_host<'a, R: Rng + ?Sized>(
    scores: &'a [HostScore],
    rng: &mut R,
) -> Option<&'a HostScore> {
    let mut iter = scores.iter();
    let mut selected = iter.next()?;
    let mut ties: u32 = 1;

    for candidate in iter {
        if candidate.total > selected.total {
            selected = candidate;
            ties = 1;
        } else if candidate.total == selected.total {
            ties += 1;
            if rng.random_range(0..ties) == 0 {
                selected = candidate;
            }
        }
    }
    Some(selected)
}

fn check_range(plugin: &str, score: &HostScore, stage: ScoreStage) -> Result<()> {
    if (0..=MAX_NODE_SCORE).contains(&score.total) {
        return Ok(());
    }
    error!(
        "Plugin {} returned {} score {} for node {}",
        plugin, stage, score.total, score.host
    );
    Err(SchedulerError::ScoreOutOfRange {
        plugin: plugin.to_string(),
        host: score.host.clone(),
        score: score.total,
        max: MAX_NODE_SCORE,
        stage,
    })
}

fn check_deadline(started: Instant, deadline: Instant) -> Result<()> {
    if Instant::now() > deadline {
        return Err(SchedulerError::CycleTimeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
    Ok(())
}

fn micros(d: Duration) -> u64 {
    d.as_micros() as u64
}
