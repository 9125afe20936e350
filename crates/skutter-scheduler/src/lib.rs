//! Skutter Scheduler - Pod to Node scheduling
//!
//! This crate provides:
//! - Three-tier scheduling queue (Active, Backoff, Unschedulable)
//! - Filter predicates (resources, node selectors, taints)
//! - Score plugin framework with weighted aggregation and random tie-break
//! - HTTP scoring extenders
//! - Control loop with asynchronous binding commits

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod extender;
pub mod filter;
pub mod framework;
pub mod heap;
pub mod observe;
pub mod parallel;
pub mod plugins;
pub mod queue;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use config::SchedulerConfig;
pub use engine::{DecisionEngine, ScheduleResult, ScoreReport};
pub use error::{Result, SchedulerError};
pub use framework::{Profile, ScorePlugin};
pub use observe::{CycleRecord, SchedulerEvent};
pub use queue::{QueueCounts, SchedulingQueue};
pub use scheduler::Scheduler;
pub use types::{FailureKind, FilterResult, HostScore, NodeInfo, WorkUnit};
