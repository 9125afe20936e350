use crate::cache::SchedulerCache;
use crate::config::SchedulerConfig;
use crate::engine::DecisionEngine;
use crate::extender::{self, run_extenders, Extender};
use crate::filter::{default_filters, filter_nodes, run_filters, FilterPredicate};
use crate::framework::Profile;
use crate::observe::{CycleLog, CycleOutcome, CycleRecord, SchedulerEvent};
use crate::queue::SchedulingQueue;
use crate::types::{FailureKind, WorkUnit};
use crate::{Result, SchedulerError};
use k8s_openapi::api::core::v1::Pod;
use skutter_core::{is_bound, node_name, ClusterEvent, UnitKey};
use skutter_storage::{Binding, ClusterStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pod scheduler: pops one pending unit at a time, picks a node for it, and
/// commits the binding in the background.
pub struct Scheduler {
    store: Arc<dyn ClusterStore>,
    queue: Arc<SchedulingQueue>,
    cache: Arc<SchedulerCache>,
    engine: Arc<DecisionEngine>,
    filters: Vec<Box<dyn FilterPredicate>>,
    extenders: Vec<Arc<dyn Extender>>,
    cycle_log: Arc<CycleLog>,
    events: broadcast::Sender<SchedulerEvent>,
    commits: TaskTracker,
}

impl Scheduler {
    /// Create a new scheduler with the built-in plugins named in `config`
    pub fn new(store: Arc<dyn ClusterStore>, config: &SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let profile = Profile::from_config(&config.profile)?;
        Self::with_profile(store, config, profile)
    }

    /// Create a new scheduler with an explicit plugin profile
    pub fn with_profile(
        store: Arc<dyn ClusterStore>,
        config: &SchedulerConfig,
        profile: Profile,
    ) -> Result<Self> {
        let engine = DecisionEngine::new(Arc::new(profile), &config.engine)?;
        let (events, _) = broadcast::channel(config.observability.event_capacity.max(1));

        Ok(Self {
            store,
            queue: Arc::new(SchedulingQueue::new(config.queue.clone())),
            cache: Arc::new(SchedulerCache::new()),
            engine: Arc::new(engine),
            filters: default_filters(),
            extenders: extender::from_config(&config.extenders)?,
            cycle_log: Arc::new(CycleLog::new(config.observability.cycle_log_capacity)),
            events,
            commits: TaskTracker::new(),
        })
    }

    /// Replace the extenders built from configuration
    pub fn with_extenders(mut self, extenders: Vec<Arc<dyn Extender>>) -> Self {
        self.extenders = extenders;
        self
    }

    pub fn queue(&self) -> &SchedulingQueue {
        &self.queue
    }

    pub fn cache(&self) -> &SchedulerCache {
        &self.cache
    }

    pub fn cycle_log(&self) -> &CycleLog {
        &self.cycle_log
    }

    /// Subscribe to scheduling outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Rebuild the cache and the queue from the store. Every pending pod
    /// lands in Active.
    pub fn resync(&self) -> Result<usize> {
        let nodes = self.store.list_nodes()?;
        let pods = self.store.list_pods()?;

        self.cache.rebuild(nodes, &pods);
        let pending: Vec<Pod> = pods.into_iter().filter(|p| !is_bound(p)).collect();
        self.queue.resync(pending)
    }

    /// Run the scheduler until `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        info!("Starting scheduler");

        // Subscribe first so no change between the listing and the watch is lost
        let cluster_events = self.store.subscribe();
        let pending = self.resync()?;
        info!(
            "Scheduler synced {} nodes, {} pending pods",
            self.cache.node_count(),
            pending
        );

        let watcher = {
            let this = self.clone();
            let token = token.clone();
            tokio::spawn(async move { this.watch_cluster(cluster_events, token).await })
        };
        let flushers = tokio::spawn(self.queue.clone().run_flushers(token.clone()));

        loop {
            let unit = tokio::select! {
                _ = token.cancelled() => break,
                unit = self.queue.pop() => match unit {
                    Some(unit) => unit,
                    None => break,
                },
            };
            self.schedule_one(unit).await;
        }

        info!("Scheduler shutting down");
        self.queue.close();
        self.commits.close();
        self.commits.wait().await;

        for task in [watcher, flushers] {
            if let Err(e) = task.await {
                error!("Scheduler background task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Wait for every commit started so far
    pub async fn drain_commits(&self) {
        self.commits.close();
        self.commits.wait().await;
        self.commits.reopen();
    }

    async fn watch_cluster(
        &self,
        mut events: broadcast::Receiver<ClusterEvent>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} cluster events, resyncing", missed);
                        if let Err(e) = self.resync() {
                            error!("Resync after missed events failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("Cluster event feed closed");
                        return;
                    }
                },
            }
        }
    }

    /// Apply one store event to the cache and the queue
    pub fn handle_event(&self, event: &ClusterEvent) {
        self.cache.apply_event(event);

        match event {
            ClusterEvent::PodAdded { pod } => {
                if !is_bound(pod) {
                    self.enqueue(pod);
                }
            }
            ClusterEvent::PodUpdated { new, .. } => {
                if is_bound(new) {
                    if let Ok(key) = UnitKey::from_pod(new) {
                        self.queue.delete(&key);
                    }
                } else if let Err(e) = self.queue.update(new.clone()) {
                    warn!("Ignoring update of unnamed pod: {}", e);
                }
            }
            ClusterEvent::PodDeleted { pod } => {
                if let Ok(key) = UnitKey::from_pod(pod) {
                    self.queue.delete(&key);
                }
                // Capacity freed on its node
                if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
                    self.wake_for_node(event.label(), node);
                }
            }
            ClusterEvent::NodeAdded { node } | ClusterEvent::NodeUpdated { new: node, .. } => {
                self.wake_for_node(event.label(), node_name(node));
            }
            ClusterEvent::NodeDeleted { .. } => {}
        }
    }

    fn enqueue(&self, pod: &Pod) {
        if let Err(e) = self.queue.add(pod.clone()) {
            warn!("Ignoring pod that cannot be queued: {}", e);
        }
    }

    /// Retry unschedulable units that would now pass the filters on `node`
    fn wake_for_node(&self, event: &str, node: &str) {
        let Some(info) = self.cache.node(node) else {
            return;
        };
        let moved = self
            .queue
            .move_unschedulable_matching(event, |unit| run_filters(&self.filters, &unit.pod, &info).passed);
        if moved > 0 {
            debug!("{} on node {} woke {} units", event, node, moved);
        }
    }

    /// Run one scheduling cycle for `unit`
    pub async fn schedule_one(&self, mut unit: WorkUnit) {
        let started = Instant::now();

        // The store is authoritative; the queued copy may be stale
        match self.store.get_pod(&unit.key) {
            Ok(Some(pod)) if is_bound(&pod) => {
                debug!("Skipping {}: already bound", unit.key);
                return;
            }
            Ok(Some(pod)) => unit.refresh(pod),
            Ok(None) => {
                debug!("Skipping {}: deleted", unit.key);
                return;
            }
            Err(e) => {
                self.fail(unit, e.into(), started);
                return;
            }
        }

        let outcome = filter_nodes(&self.filters, &unit.pod, self.cache.snapshot());
        if outcome.feasible.is_empty() {
            let err = SchedulerError::no_feasible_hosts(unit.key.to_string(), outcome.message());
            self.fail(unit, err, started);
            return;
        }

        let extender_scores = match run_extenders(&self.extenders, &unit.pod, &outcome.feasible).await
        {
            Ok(scores) => scores,
            Err(e) => {
                self.fail(unit, e, started);
                return;
            }
        };

        // Scoring is CPU bound and fans out onto the worker pool
        let engine = self.engine.clone();
        let scoring_unit = unit.clone();
        let feasible = outcome.feasible;
        let scored = tokio::task::spawn_blocking(move || {
            engine.schedule(&scoring_unit, &feasible, &extender_scores)
        })
        .await;

        let result = match scored {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.fail(unit, e, started);
                return;
            }
            Err(e) => {
                let err = SchedulerError::internal_error(format!("scoring task failed: {}", e));
                self.fail(unit, err, started);
                return;
            }
        };

        if let Err(e) = self.cache.assume(&unit.key, unit.requests(), &result.host) {
            self.fail(unit, e, started);
            return;
        }

        debug!(
            "Pod {} assigned to node {} (score {}, {} nodes evaluated)",
            unit.key, result.host, result.total, result.evaluated
        );

        let mut record = CycleRecord::new(
            unit.key.clone(),
            unit.attempts,
            CycleOutcome::Selected {
                host: result.host.clone(),
                total: result.total,
            },
        );
        record.duration_us = started.elapsed().as_micros() as u64;
        record.report = Some(result.report);
        self.cycle_log.push(record);

        self.commits.spawn(commit(
            self.store.clone(),
            self.cache.clone(),
            self.queue.clone(),
            self.events.clone(),
            unit,
            result.host,
        ));
    }

    fn fail(&self, unit: WorkUnit, err: SchedulerError, started: Instant) {
        let kind = err.failure_kind();
        let reason = match &err {
            SchedulerError::NoFeasibleHosts { reason, .. } => reason.clone(),
            other => other.to_string(),
        };

        match kind {
            FailureKind::Infeasible => info!("Pod {} is unschedulable: {}", unit.key, reason),
            FailureKind::PluginPrecondition | FailureKind::ScoreRangeViolation => {
                error!("Scheduling {} failed: {}", unit.key, reason)
            }
            _ => warn!("Scheduling {} failed: {}", unit.key, reason),
        }

        let mut record = CycleRecord::new(
            unit.key.clone(),
            unit.attempts,
            CycleOutcome::Failed {
                kind,
                reason: reason.clone(),
            },
        );
        record.duration_us = started.elapsed().as_micros() as u64;
        self.cycle_log.push(record);

        let _ = self.events.send(SchedulerEvent::FailedScheduling {
            unit: unit.key.clone(),
            kind,
            reason: reason.clone(),
        });
        self.queue.requeue_failed(unit, kind, reason);
    }
}

/// Write the binding; on rejection release the reservation and retry later
async fn commit(
    store: Arc<dyn ClusterStore>,
    cache: Arc<SchedulerCache>,
    queue: Arc<SchedulingQueue>,
    events: broadcast::Sender<SchedulerEvent>,
    unit: WorkUnit,
    node: String,
) {
    let binding = Binding::new(unit.key.clone(), node.clone())
        .with_expected_version(unit.pod.metadata.resource_version.clone());

    match store.bind_pod(&binding) {
        Ok(_) => {
            cache.finish_binding(&unit.key);
            info!("Scheduled pod {} to node {}", unit.key, node);
            let _ = events.send(SchedulerEvent::Scheduled {
                unit: unit.key.clone(),
                node,
            });
        }
        Err(e) => {
            cache.forget(&unit.key);
            warn!("Binding {} to node {} failed: {}", unit.key, node, e);
            let reason = e.to_string();
            let _ = events.send(SchedulerEvent::BindingFailed {
                unit: unit.key.clone(),
                node,
                reason: reason.clone(),
            });
            queue.requeue_failed(unit, FailureKind::CommitConflict, reason);
        }
    }
}
