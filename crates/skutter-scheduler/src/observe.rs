//! Read-only record of scheduling activity.
//!
//! Nothing here feeds back into scheduling decisions.

use crate::engine::ScoreReport;
use crate::types::FailureKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use skutter_core::UnitKey;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Notification published for every scheduling outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    /// The binding was committed
    Scheduled { unit: UnitKey, node: String },
    /// The cycle failed and the unit was requeued
    FailedScheduling {
        unit: UnitKey,
        kind: FailureKind,
        reason: String,
    },
    /// A host was chosen but the store rejected the binding
    BindingFailed {
        unit: UnitKey,
        node: String,
        reason: String,
    },
}

impl SchedulerEvent {
    pub fn unit(&self) -> &UnitKey {
        match self {
            Self::Scheduled { unit, .. }
            | Self::FailedScheduling { unit, .. }
            | Self::BindingFailed { unit, .. } => unit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// A host was chosen and its commit started
    Selected { host: String, total: i64 },
    Failed { kind: FailureKind, reason: String },
}

/// One scheduling cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub unit: UnitKey,
    /// Failed attempts before this cycle
    pub attempts: u32,
    pub duration_us: u64,
    pub outcome: CycleOutcome,
    /// Per-plugin timings and scores; absent when the cycle failed before
    /// scoring finished
    pub report: Option<ScoreReport>,
}

impl CycleRecord {
    pub fn new(unit: UnitKey, attempts: u32, outcome: CycleOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            unit,
            attempts,
            duration_us: 0,
            outcome,
            report: None,
        }
    }
}

/// Ring buffer of the most recent cycles
pub struct CycleLog {
    records: Mutex<VecDeque<CycleRecord>>,
    capacity: usize,
}

impl CycleLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: CycleRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Up to `n` records, newest first
    pub fn recent(&self, n: usize) -> Vec<CycleRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.iter().rev().take(n).cloned().collect()
    }

    /// Newest record for `unit`
    pub fn last_for(&self, unit: &UnitKey) -> Option<CycleRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.iter().rev().find(|r| &r.unit == unit).cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> CycleRecord {
        CycleRecord::new(
            UnitKey::new("default", name),
            0,
            CycleOutcome::Selected {
                host: "node1".to_string(),
                total: 100,
            },
        )
    }

    #[test]
    fn test_cycle_log_is_bounded() {
        let log = CycleLog::new(3);
        for i in 0..5 {
            log.push(record(&format!("p{}", i)));
        }

        assert_eq!(log.len(), 3);
        let names: Vec<String> = log.recent(10).into_iter().map(|r| r.unit.name).collect();
        assert_eq!(names, vec!["p4", "p3", "p2"]);
        assert!(log.last_for(&UnitKey::new("default", "p0")).is_none());
        assert!(log.last_for(&UnitKey::new("default", "p3")).is_some());
    }

    #[test]
    fn test_event_serialization() {
        let event = SchedulerEvent::FailedScheduling {
            unit: UnitKey::new("default", "web"),
            kind: FailureKind::Infeasible,
            reason: "0/1 nodes are available: 1 Insufficient cpu.".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "FailedScheduling");
        assert_eq!(json["kind"], "Infeasible");
        assert_eq!(event.unit().name, "web");
    }
}
