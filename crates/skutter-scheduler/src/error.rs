// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use crate::types::{FailureKind, ScoreStage};
use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// No node passed the constraint filters
    #[error("No feasible nodes for pod {unit}: {reason}")]
    #[diagnostic(
        code(scheduler::no_feasible_nodes),
        help("Check node resources, taints, and pod requirements")
    )]
    NoFeasibleHosts { unit: String, reason: String },

    /// A PreScore hook rejected the cycle
    #[error("PreScore of plugin {plugin} failed: {message}")]
    #[diagnostic(
        code(scheduler::pre_score_failed),
        help("The plugin could not build its shared state for this pod; no partial scores were used")
    )]
    PreScoreFailed { plugin: String, message: String },

    /// A Score hook failed for one node
    #[error("Score of plugin {plugin} failed on node {host}: {message}")]
    #[diagnostic(
        code(scheduler::score_failed),
        help("This signals a misbehaving plugin, not an ordinary cluster condition")
    )]
    ScoreFailed {
        plugin: String,
        host: String,
        message: String,
    },

    /// A NormalizeScore hook failed
    #[error("NormalizeScore of plugin {plugin} failed: {message}")]
    #[diagnostic(
        code(scheduler::normalize_failed),
        help("This signals a misbehaving plugin, not an ordinary cluster condition")
    )]
    NormalizeFailed { plugin: String, message: String },

    /// A plugin produced a score outside [0, MAX_NODE_SCORE]
    #[error("Plugin {plugin} returned {stage} score {score} for node {host}, outside [0, {max}]")]
    #[diagnostic(
        code(scheduler::score_out_of_range),
        help("Scores are never clamped; fix the plugin so it stays within range")
    )]
    ScoreOutOfRange {
        plugin: String,
        host: String,
        score: i64,
        max: i64,
        stage: ScoreStage,
    },

    /// A non-ignorable extender failed
    #[error("Extender {extender} failed: {message}")]
    #[diagnostic(
        code(scheduler::extender_failed),
        help("Check that the extender endpoint is reachable, or mark it ignorable")
    )]
    ExtenderFailed { extender: String, message: String },

    /// The scoring cycle ran past its deadline
    #[error("Scheduling cycle exceeded its deadline after {elapsed_ms}ms")]
    #[diagnostic(
        code(scheduler::cycle_timeout),
        help("Partial scores are discarded; consider raising engine.cycle_timeout or lowering plugin cost")
    )]
    CycleTimeout { elapsed_ms: u64 },

    /// Configuration rejected at startup
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(scheduler::invalid_config), help("{suggestion}"))]
    InvalidConfig { message: String, suggestion: String },

    /// Storage error
    #[error("Storage error: {0}")]
    #[diagnostic(
        code(scheduler::storage_error),
        help("Check the underlying storage system")
    )]
    StorageError(#[from] skutter_storage::StorageError),

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(code(scheduler::core_error), help("This is an internal error"))]
    CoreError(#[from] skutter_core::CoreError),

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError { message: String },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a NoFeasibleHosts error
    pub fn no_feasible_hosts(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoFeasibleHosts {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Classify the error into the queue transition it should cause
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::NoFeasibleHosts { .. } => FailureKind::Infeasible,
            Self::PreScoreFailed { .. }
            | Self::ScoreFailed { .. }
            | Self::NormalizeFailed { .. }
            | Self::ExtenderFailed { .. } => FailureKind::PluginPrecondition,
            Self::ScoreOutOfRange { .. } => FailureKind::ScoreRangeViolation,
            Self::CycleTimeout { .. } => FailureKind::CycleTimeout,
            Self::StorageError(e) if e.is_conflict() => FailureKind::CommitConflict,
            _ => FailureKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skutter_storage::StorageError;

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(
            SchedulerError::no_feasible_hosts("default/a", "0/3 nodes").failure_kind(),
            FailureKind::Infeasible
        );
        assert_eq!(
            SchedulerError::ScoreOutOfRange {
                plugin: "p".into(),
                host: "h".into(),
                score: 101,
                max: 100,
                stage: ScoreStage::Normalized,
            }
            .failure_kind(),
            FailureKind::ScoreRangeViolation
        );
        assert_eq!(
            SchedulerError::from(StorageError::conflict("default/a", "stale")).failure_kind(),
            FailureKind::CommitConflict
        );
        assert_eq!(
            SchedulerError::from(StorageError::transaction_error("busy")).failure_kind(),
            FailureKind::Internal
        );
        assert_eq!(
            SchedulerError::CycleTimeout { elapsed_ms: 10 }.failure_kind(),
            FailureKind::CycleTimeout
        );
    }
}
