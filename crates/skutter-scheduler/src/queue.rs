//! Three-tier scheduling queue.
//!
//! A pending unit lives in exactly one of:
//!
//! - **Active**: ready to be popped, ordered by priority (desc), then
//!   enqueue time (asc), then enqueue order
//! - **Backoff**: failed recently, ordered by the time its backoff expires
//! - **Unschedulable**: no node fits; parked until a cluster change that
//!   could help, or until it has waited longer than the max dwell time
//!
//! A unit that is currently being scheduled is held by the caller of
//! [`SchedulingQueue::pop`] and is in none of the tiers until it is handed
//! back with [`SchedulingQueue::requeue_failed`] or dropped on success.

use crate::config::QueueConfig;
use crate::heap::{Keyed, KeyedHeap};
use crate::types::{FailureKind, WorkUnit};
use crate::Result;
use k8s_openapi::api::core::v1::Pod;
use skutter_core::UnitKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

impl Keyed for WorkUnit {
    type Key = UnitKey;

    fn key(&self) -> &UnitKey {
        &self.key
    }
}

fn active_less(a: &WorkUnit, b: &WorkUnit) -> bool {
    if a.priority != b.priority {
        return a.priority > b.priority;
    }
    if a.enqueued_at != b.enqueued_at {
        return a.enqueued_at < b.enqueued_at;
    }
    a.seq < b.seq
}

fn backoff_less(a: &WorkUnit, b: &WorkUnit) -> bool {
    (a.ready_at, a.seq) < (b.ready_at, b.seq)
}

/// Tier a unit currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLocation {
    Active,
    Backoff,
    Unschedulable,
}

/// Number of units per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub active: usize,
    pub backoff: usize,
    pub unschedulable: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.active + self.backoff + self.unschedulable
    }
}

struct QueueState {
    active: KeyedHeap<WorkUnit>,
    backoff: KeyedHeap<WorkUnit>,
    unschedulable: HashMap<UnitKey, WorkUnit>,
    /// Incremented on every pop
    scheduling_cycle: u64,
    /// Cycle during which the last move request arrived
    move_request_cycle: Option<u64>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn location(&self, key: &UnitKey) -> Option<QueueLocation> {
        if self.active.contains(key) {
            Some(QueueLocation::Active)
        } else if self.backoff.contains(key) {
            Some(QueueLocation::Backoff)
        } else if self.unschedulable.contains_key(key) {
            Some(QueueLocation::Unschedulable)
        } else {
            None
        }
    }

    fn new_unit(&mut self, pod: Pod, now: Instant) -> Result<WorkUnit> {
        let mut unit = WorkUnit::new(pod)?;
        unit.enqueued_at = now;
        unit.seq = self.next_seq;
        self.next_seq += 1;
        Ok(unit)
    }

    /// Place a unit leaving Unschedulable: Backoff if its backoff has not
    /// expired yet, Active otherwise. Returns true if it went to Active.
    fn activate_or_backoff(&mut self, mut unit: WorkUnit, now: Instant) -> bool {
        unit.unschedulable_since = None;
        match unit.ready_at {
            Some(ready_at) if ready_at > now => {
                self.backoff.insert(unit);
                false
            }
            _ => {
                self.active.insert(unit);
                true
            }
        }
    }

    fn move_unschedulable(&mut self, keys: Vec<UnitKey>, now: Instant) -> usize {
        let mut activated = 0;
        for key in keys {
            if let Some(unit) = self.unschedulable.remove(&key) {
                if self.activate_or_backoff(unit, now) {
                    activated += 1;
                }
            }
        }
        activated
    }
}

/// Priority queue of pending units with retry tiers
pub struct SchedulingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl SchedulingQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                active: KeyedHeap::new(active_less),
                backoff: KeyedHeap::new(backoff_less),
                unschedulable: HashMap::new(),
                scheduling_cycle: 0,
                move_request_cycle: None,
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Backoff after `attempts` failures:
    /// `min(initial * multiplier^(attempts - 1), max)`
    pub fn backoff_duration(&self, attempts: u32) -> Duration {
        let max = self.config.max_backoff;
        let mut backoff = self.config.initial_backoff;
        for _ in 1..attempts {
            backoff = backoff.saturating_mul(self.config.backoff_multiplier);
            if backoff >= max {
                return max;
            }
        }
        backoff.min(max)
    }

    /// Enqueue a newly observed pending pod. If the pod is already queued
    /// its payload is refreshed instead.
    pub fn add(&self, pod: Pod) -> Result<()> {
        self.upsert(pod)
    }

    /// Apply an update of a queued pod. A pod not yet queued is added to
    /// Active; an unschedulable pod is given another chance, since its
    /// requirements may have changed.
    pub fn update(&self, pod: Pod) -> Result<()> {
        self.upsert(pod)
    }

    fn upsert(&self, pod: Pod) -> Result<()> {
        let key = UnitKey::from_pod(&pod)?;
        let now = Instant::now();
        let mut state = self.state();

        let activated = match state.location(&key) {
            Some(QueueLocation::Active) => {
                state.active.update_rank(&key, |u| u.refresh(pod));
                true
            }
            Some(QueueLocation::Backoff) => {
                state.backoff.update_rank(&key, |u| u.refresh(pod));
                false
            }
            Some(QueueLocation::Unschedulable) => {
                let unit = state.unschedulable.remove(&key);
                match unit {
                    Some(mut unit) => {
                        unit.refresh(pod);
                        state.activate_or_backoff(unit, now)
                    }
                    None => false,
                }
            }
            None => {
                let unit = state.new_unit(pod, now)?;
                trace!("Queued {} (priority {})", unit.key, unit.priority);
                state.active.insert(unit);
                true
            }
        };
        drop(state);

        if activated {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Drop a unit from whichever tier holds it
    pub fn delete(&self, key: &UnitKey) -> bool {
        let mut state = self.state();
        state.active.remove(key).is_some()
            || state.backoff.remove(key).is_some()
            || state.unschedulable.remove(key).is_some()
    }

    /// Wait for the highest-ranked Active unit.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<WorkUnit> {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(mut unit) = state.active.pop() {
                    state.scheduling_cycle += 1;
                    unit.cycle = state.scheduling_cycle;
                    return Some(unit);
                }
            }
            notified.await;
        }
    }

    /// Hand back a unit whose scheduling attempt failed.
    ///
    /// Infeasible units are parked in Unschedulable, unless a move request
    /// arrived while they were being scheduled, in which case they back off
    /// like every other failure kind.
    pub fn requeue_failed(&self, mut unit: WorkUnit, kind: FailureKind, reason: impl Into<String>) {
        let now = Instant::now();
        unit.attempts = unit.attempts.saturating_add(1);
        unit.last_failure = Some(kind);
        unit.last_reason = Some(reason.into());
        unit.ready_at = Some(now + self.backoff_duration(unit.attempts));

        let mut state = self.state();
        if let Some(location) = state.location(&unit.key) {
            // Re-added by an event while in flight; the newer entry wins
            debug!(
                "Dropping requeue of {}, already queued in {:?}",
                unit.key, location
            );
            return;
        }

        let moved_during_cycle = state
            .move_request_cycle
            .is_some_and(|cycle| cycle >= unit.cycle);

        if !kind.is_transient() && !moved_during_cycle {
            debug!(
                "Unit {} is unschedulable after {} attempts",
                unit.key, unit.attempts
            );
            unit.unschedulable_since = Some(now);
            state.unschedulable.insert(unit.key.clone(), unit);
        } else {
            debug!(
                "Unit {} backing off for {:?} after {} failure",
                unit.key,
                self.backoff_duration(unit.attempts),
                kind
            );
            state.backoff.insert(unit);
        }
    }

    /// Move every unit whose backoff has expired to Active
    pub fn flush_backoff_completed(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state();

        let mut moved = 0;
        while state
            .backoff
            .peek()
            .is_some_and(|u| u.ready_at.map_or(true, |t| t <= now))
        {
            if let Some(unit) = state.backoff.pop() {
                state.active.insert(unit);
                moved += 1;
            }
        }
        drop(state);

        if moved > 0 {
            trace!("Moved {} units from Backoff to Active", moved);
            self.notify.notify_waiters();
        }
        moved
    }

    /// Retry units that have waited in Unschedulable longer than the max
    /// dwell time
    pub fn flush_unschedulable_leftover(&self) -> usize {
        let now = Instant::now();
        let dwell = self.config.max_unschedulable_dwell;
        let mut state = self.state();

        let keys: Vec<UnitKey> = state
            .unschedulable
            .values()
            .filter(|u| {
                u.unschedulable_since
                    .map_or(true, |since| now.duration_since(since) > dwell)
            })
            .map(|u| u.key.clone())
            .collect();
        if keys.is_empty() {
            return 0;
        }

        let count = keys.len();
        let activated = state.move_unschedulable(keys, now);
        drop(state);

        debug!("Retrying {} units that exceeded the unschedulable dwell time", count);
        if activated > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// React to a cluster change: every Unschedulable unit for which
    /// `may_help` returns true moves to Active (or Backoff, if its backoff
    /// has not expired). Also records a move request so units currently in
    /// flight are not parked on a stale view.
    pub fn move_unschedulable_matching<F>(&self, event: &str, may_help: F) -> usize
    where
        F: Fn(&WorkUnit) -> bool,
    {
        let now = Instant::now();
        let mut state = self.state();
        state.move_request_cycle = Some(state.scheduling_cycle);

        let keys: Vec<UnitKey> = state
            .unschedulable
            .values()
            .filter(|u| may_help(u))
            .map(|u| u.key.clone())
            .collect();
        if keys.is_empty() {
            return 0;
        }

        let count = keys.len();
        let activated = state.move_unschedulable(keys, now);
        drop(state);

        debug!("{} moved {} unschedulable units", event, count);
        if activated > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// Move every Unschedulable unit, regardless of why it failed
    pub fn move_all_unschedulable(&self, event: &str) -> usize {
        self.move_unschedulable_matching(event, |_| true)
    }

    /// Rebuild the queue from the authoritative set of pending pods.
    ///
    /// Every tier is cleared and each pod is placed in Active with fresh
    /// bookkeeping; retry history does not survive.
    pub fn resync(&self, pods: Vec<Pod>) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state();

        state.active.drain();
        state.backoff.drain();
        state.unschedulable.clear();

        for pod in pods {
            let unit = state.new_unit(pod, now)?;
            state.active.insert(unit);
        }
        let count = state.active.len();
        drop(state);

        info!("Queue rebuilt with {} pending units", count);
        self.notify.notify_waiters();
        Ok(count)
    }

    /// Wake every waiting `pop` and make it return `None`
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.state();
        QueueCounts {
            active: state.active.len(),
            backoff: state.backoff.len(),
            unschedulable: state.unschedulable.len(),
        }
    }

    pub fn location(&self, key: &UnitKey) -> Option<QueueLocation> {
        self.state().location(key)
    }

    /// Snapshot of a queued unit
    pub fn get(&self, key: &UnitKey) -> Option<WorkUnit> {
        let state = self.state();
        state
            .active
            .get(key)
            .or_else(|| state.backoff.get(key))
            .or_else(|| state.unschedulable.get(key))
            .cloned()
    }

    /// Last failure reason of every Unschedulable unit, sorted by key
    pub fn unschedulable_reasons(&self) -> Vec<(UnitKey, String)> {
        let state = self.state();
        let mut reasons: Vec<(UnitKey, String)> = state
            .unschedulable
            .values()
            .map(|u| (u.key.clone(), u.last_reason.clone().unwrap_or_default()))
            .collect();
        reasons.sort();
        reasons
    }

    /// Run the periodic Backoff and Unschedulable sweeps until cancelled
    pub async fn run_flushers(self: Arc<Self>, token: CancellationToken) {
        let mut backoff_tick = tokio::time::interval(self.config.backoff_flush_interval);
        backoff_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut unschedulable_tick =
            tokio::time::interval(self.config.unschedulable_flush_interval);
        unschedulable_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Queue flushers shutting down");
                    return;
                }
                _ = backoff_tick.tick() => {
                    self.flush_backoff_completed();
                }
                _ = unschedulable_tick.tick() => {
                    self.flush_unschedulable_leftover();
                }
            }
        }
    }
}
