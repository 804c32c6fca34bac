//! Topology Engine - Wires the components together and runs the loops
//!
//! One inbound path ([`TopologyEngine::handle_event`]) and four background
//! tasks share the tracker, queue and pending table:
//!
//! - queue processing: gate → token → dequeue → send
//! - periodic recheck: enqueue nodes whose recheck time passed
//! - autosave: write the state file on a fixed interval
//! - timeout sweep: expire probes, schedule and release retries
//!
//! All four hang off one [`CancellationToken`] and are joined by `stop()`.

use chrono::{DateTime, Utc};
use meshgate_core::{MeshEvent, NodeId, TopologyConfig, TracerouteResponsePacket};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::to_delta;
use crate::dispatch::MeshDispatcher;
use crate::error::{TopologyError, TopologyResult};
use crate::health::{HealthState, NetworkHealthMonitor, SendGate};
use crate::node_state::{NodeCounts, NodeState, NodeStateTracker, NodeTransition, TraceDecision};
use crate::persistence::StatePersistence;
use crate::queue::{EnqueueOutcome, PriorityQueue, QueueStats, TracerouteRequest};
use crate::rate_limiter::RateLimiter;
use crate::traceroute::{ResponseOutcome, TimeoutSweep, TracerouteManager, TracerouteResult};

/// Result of one attempt to move a request from the queue to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendAttempt {
    /// Probe handed to the dispatch boundary
    Sent {
        /// Probed node
        node_id: NodeId,
        /// Correlation id of the probe
        request_id: u32,
    },
    /// Nothing queued
    Idle,
    /// Sending currently forbidden
    Gated(SendGate),
    /// No token available
    RateLimited,
    /// Request dequeued but not sent
    Dropped {
        /// Node whose request was dropped
        node_id: NodeId,
    },
}

/// Engine health and activity, as returned by [`TopologyEngine::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyStatus {
    /// Probing enabled by configuration
    pub enabled: bool,
    /// Background loops running
    pub running: bool,
    /// Health state is healthy
    pub healthy: bool,
    /// Health state
    pub health_state: HealthState,
    /// Emergency stop in effect
    pub emergency_stop: bool,
    /// Inside the quiet window
    pub quiet_hours: bool,
    /// Sending at a throttled rate
    pub throttled: bool,
    /// Queued requests
    pub queue_size: usize,
    /// Probes in flight
    pub pending_probes: usize,
    /// Retries waiting out their backoff
    pub scheduled_retries: usize,
    /// Known nodes by classification
    pub nodes: NodeCounts,
    /// Probes sent since start
    pub total_sent: u64,
    /// Probes answered since start
    pub total_succeeded: u64,
    /// Probes failed since start
    pub total_failed: u64,
    /// Succeeded over completed attempts, if any completed
    pub success_rate: Option<f64>,
    /// Rate currently applied to the limiter (probes per minute)
    pub effective_rate: f64,
    /// Queue counters
    pub queue: QueueStats,
}

struct EngineInner {
    config: TopologyConfig,
    tracker: NodeStateTracker,
    queue: Mutex<PriorityQueue>,
    limiter: RateLimiter,
    health: NetworkHealthMonitor,
    traceroute: TracerouteManager,
    persistence: StatePersistence,
    dispatcher: Arc<dyn MeshDispatcher>,
}

struct RunningTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Topology-discovery engine.
pub struct TopologyEngine {
    inner: Arc<EngineInner>,
    tasks: Mutex<Option<RunningTasks>>,
    running: AtomicBool,
}

impl std::fmt::Debug for TopologyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyEngine")
            .field("running", &self.is_running())
            .field("traceroute", &self.inner.traceroute)
            .finish()
    }
}

impl TopologyEngine {
    /// Build an engine from validated configuration.
    pub fn new(config: TopologyConfig, dispatcher: Arc<dyn MeshDispatcher>) -> TopologyResult<Self> {
        config.validate()?;

        let inner = EngineInner {
            tracker: NodeStateTracker::new(&config),
            queue: Mutex::new(PriorityQueue::new(
                config.queue_max_size,
                config.queue_overflow_strategy,
            )),
            limiter: RateLimiter::new(config.rate_per_minute, config.burst_multiplier),
            health: NetworkHealthMonitor::new(&config)?,
            traceroute: TracerouteManager::new(&config, dispatcher.clone()),
            persistence: StatePersistence::new(&config.state_persistence),
            dispatcher,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Restore persisted state and spawn the background loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> TopologyResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TopologyError::InvalidState(
                "topology engine already running".to_string(),
            ));
        }

        let inner = &self.inner;
        if inner.config.state_persistence.enabled {
            let state = inner.persistence.load();
            let restored = inner.tracker.restore(state.nodes);
            info!(restored, "Node states restored");
        }

        if inner.config.initial_discovery_enabled {
            inner.initial_discovery(Utc::now());
        }

        let cancel = CancellationToken::new();
        let mut handles = vec![
            spawn_loop(inner, &cancel, EngineInner::run_queue),
            spawn_loop(inner, &cancel, EngineInner::run_timeout_sweep),
        ];
        if inner.config.rechecks_enabled {
            handles.push(spawn_loop(inner, &cancel, EngineInner::run_rechecks));
        }
        if inner.config.state_persistence.enabled {
            handles.push(spawn_loop(inner, &cancel, EngineInner::run_autosave));
        }

        info!(
            enabled = inner.config.enabled,
            rate_per_minute = inner.config.rate_per_minute,
            loops = handles.len(),
            "Topology engine started"
        );
        *self.tasks.lock() = Some(RunningTasks { cancel, handles });
        Ok(())
    }

    /// Cancel and join the loops, save state, and drop queued and pending work.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };

        tasks.cancel.cancel();
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Topology loop ended abnormally");
            }
        }

        self.inner.save();
        self.inner.queue.lock().clear();
        self.inner.traceroute.clear();
        self.running.store(false, Ordering::SeqCst);
        info!("Topology engine stopped");
    }

    /// Whether the background loops are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Process one inbound mesh event.
    pub fn handle_event(&self, event: &MeshEvent) {
        self.handle_event_at(event, Utc::now());
    }

    /// Process one inbound mesh event observed at `now`.
    pub fn handle_event_at(&self, event: &MeshEvent, now: DateTime<Utc>) {
        self.inner.handle_event(event, now);
    }

    /// Queue an operator-requested trace at the manual tier.
    pub fn request_trace(&self, node_id: &str) -> TopologyResult<EnqueueOutcome> {
        let decision = self.inner.tracker.trace_decision(node_id);
        if decision != TraceDecision::Allowed {
            return Err(TopologyError::NotTraceable {
                node_id: node_id.to_string(),
                reason: format!("{:?}", decision),
            });
        }
        let tier = self.inner.config.priorities.manual;
        self.inner
            .enqueue(node_id, tier, "manual", Utc::now())
            .ok_or_else(|| TopologyError::AlreadyPending {
                node_id: node_id.to_string(),
            })
    }

    /// Send the next queued probe if gating and the rate limiter allow it now.
    pub fn try_send_next(&self, now: DateTime<Utc>) -> SendAttempt {
        let inner = &self.inner;
        inner.sync_rate();
        let gate = inner.health.send_gate(now);
        if gate != SendGate::Allowed {
            return SendAttempt::Gated(gate);
        }
        if inner.queue.lock().is_empty() {
            return SendAttempt::Idle;
        }
        if !inner.limiter.try_acquire() {
            return SendAttempt::RateLimited;
        }
        inner.send_next(now)
    }

    /// Run one timeout sweep at `now`.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> TimeoutSweep {
        self.inner.sweep_timeouts(now)
    }

    /// Queue every node due a recheck at `now`; returns how many were queued.
    pub fn scan_rechecks(&self, now: DateTime<Utc>) -> usize {
        self.inner.scan_rechecks(now)
    }

    /// Write the state file now; does nothing when persistence is disabled.
    pub fn save(&self) -> TopologyResult<()> {
        self.inner.try_save()
    }

    /// Manual override for an emergency stop.
    pub fn reset_emergency_stop(&self) {
        self.inner.health.reset();
    }

    /// Current engine status.
    pub fn status(&self) -> TopologyStatus {
        self.status_at(Utc::now())
    }

    /// Engine status with quiet hours evaluated at `now`.
    pub fn status_at(&self, now: DateTime<Utc>) -> TopologyStatus {
        let inner = &self.inner;
        let metrics = inner.health.metrics();
        let (queue_size, queue_stats) = {
            let queue = inner.queue.lock();
            (queue.len(), queue.stats())
        };
        let completed = metrics.total_succeeded + metrics.total_failed;

        TopologyStatus {
            enabled: inner.config.enabled,
            running: self.is_running(),
            healthy: metrics.state == HealthState::Healthy,
            health_state: metrics.state,
            emergency_stop: metrics.state == HealthState::EmergencyStop,
            quiet_hours: inner.health.is_quiet_hours(now),
            throttled: metrics.state == HealthState::Congested,
            queue_size,
            pending_probes: inner.traceroute.pending_count(),
            scheduled_retries: inner.traceroute.scheduled_retry_count(),
            nodes: inner.tracker.counts(),
            total_sent: metrics.total_sent,
            total_succeeded: metrics.total_succeeded,
            total_failed: metrics.total_failed,
            success_rate: (completed > 0)
                .then(|| metrics.total_succeeded as f64 / completed as f64),
            effective_rate: inner.limiter.rate(),
            queue: queue_stats,
        }
    }

    /// Copy of a node's state.
    pub fn node(&self, node_id: &str) -> Option<NodeState> {
        self.inner.tracker.get(node_id)
    }

    /// A node's retained trace results, newest last.
    pub fn history(&self, node_id: &str) -> Vec<TracerouteResult> {
        self.inner.persistence.history(node_id)
    }

    /// Queued requests in dequeue order.
    pub fn queued(&self) -> Vec<TracerouteRequest> {
        self.inner.queue.lock().snapshot()
    }

    /// Whether a probe is in flight for the node.
    pub fn is_pending(&self, node_id: &str) -> bool {
        self.inner.traceroute.is_pending(node_id)
    }
}

fn spawn_loop<F, Fut>(
    inner: &Arc<EngineInner>,
    cancel: &CancellationToken,
    body: F,
) -> JoinHandle<()>
where
    F: FnOnce(Arc<EngineInner>, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(body(inner.clone(), cancel.clone()))
}

impl EngineInner {
    fn handle_event(&self, event: &MeshEvent, now: DateTime<Utc>) {
        let sender = event.sender();
        let transition = self.tracker.update(sender, now);

        let mut traced = false;
        if let MeshEvent::TracerouteResponse(packet) = event {
            traced = self.complete_response(packet, now);
        }

        if event.is_probe_traffic() {
            if let Err(e) = self.dispatcher.forward(event) {
                warn!(error = %e, node_id = %sender.node_id, "Probe traffic not forwarded");
            }
        }

        let node_id = &sender.node_id;
        let tiers = &self.config.priorities;
        match transition {
            NodeTransition::NewNode if !sender.is_direct && !traced => {
                self.enqueue(node_id, tiers.new_node, "new node", now);
            }
            NodeTransition::BackOnline if !traced => {
                self.enqueue(node_id, tiers.back_online, "back online", now);
            }
            NodeTransition::BecameIndirect if !traced => {
                self.enqueue(node_id, tiers.back_online, "became indirect", now);
            }
            NodeTransition::BecameDirect => {
                let dequeued = self.queue.lock().remove(node_id).is_some();
                let cancelled = self.traceroute.cancel(node_id);
                if dequeued || cancelled {
                    debug!(node_id = %node_id, "Node now direct, trace withdrawn");
                }
            }
            _ => {}
        }
    }

    /// Returns whether the response finished one of our probes.
    fn complete_response(&self, packet: &TracerouteResponsePacket, now: DateTime<Utc>) -> bool {
        match self.traceroute.handle_response(packet, now) {
            ResponseOutcome::Completed(result) => {
                self.health.record_success(now);
                self.tracker.mark_traced(&result.node_id, true, now);
                self.persistence.record_history(result);
                true
            }
            ResponseOutcome::Malformed(result) => {
                self.tracker.mark_traced(&result.node_id, false, now);
                self.persistence.record_history(result);
                true
            }
            ResponseOutcome::Unsolicited => false,
        }
    }

    fn enqueue(
        &self,
        node_id: &str,
        priority: u8,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<EnqueueOutcome> {
        if !self.tracker.should_trace(node_id) || self.traceroute.is_pending(node_id) {
            return None;
        }
        Some(self.queue.lock().enqueue(node_id, priority, reason, now))
    }

    fn initial_discovery(&self, now: DateTime<Utc>) {
        let tier = self.config.priorities.initial_discovery;
        let queued = self
            .tracker
            .indirect_nodes()
            .iter()
            .filter_map(|node_id| self.enqueue(node_id, tier, "initial discovery", now))
            .filter(EnqueueOutcome::is_queued)
            .count();
        info!(queued, "Initial discovery queued known indirect nodes");
    }

    fn sync_rate(&self) {
        let target = self.health.recommended_rate(self.config.rate_per_minute);
        self.limiter.set_rate(target);
    }

    /// Dequeue and send, re-checking gating first. A token has been taken.
    fn send_next(&self, now: DateTime<Utc>) -> SendAttempt {
        let Some(request) = self.queue.lock().dequeue() else {
            return SendAttempt::Idle;
        };

        let gate = self.health.send_gate(now);
        if gate != SendGate::Allowed {
            self.queue.lock().requeue(request);
            return SendAttempt::Gated(gate);
        }

        if !self.tracker.should_trace(&request.node_id) {
            return SendAttempt::Dropped {
                node_id: request.node_id,
            };
        }

        match self.traceroute.send(&request, now) {
            // The node may have turned direct while the probe went out
            Ok(_) if !self.tracker.should_trace(&request.node_id) => {
                self.traceroute.cancel(&request.node_id);
                debug!(node_id = %request.node_id, "Node no longer traceable, probe abandoned");
                SendAttempt::Dropped {
                    node_id: request.node_id,
                }
            }
            Ok(request_id) => {
                self.health.record_sent();
                SendAttempt::Sent {
                    node_id: request.node_id,
                    request_id,
                }
            }
            Err(TopologyError::AlreadyPending { node_id }) => {
                debug!(node_id = %node_id, "Probe already in flight, request dropped");
                SendAttempt::Dropped { node_id }
            }
            Err(e) => {
                warn!(node_id = %request.node_id, error = %e, "Traceroute send failed");
                SendAttempt::Dropped {
                    node_id: request.node_id,
                }
            }
        }
    }

    fn sweep_timeouts(&self, now: DateTime<Utc>) -> TimeoutSweep {
        let sweep = self.traceroute.check_timeouts(now);

        for _ in &sweep.retries_scheduled {
            self.health.record_failure(now);
        }
        for result in &sweep.failures {
            self.health.record_failure(now);
            self.tracker.mark_traced(&result.node_id, false, now);
            self.persistence.record_history(result.clone());
        }
        for request in &sweep.due_retries {
            if self.tracker.should_trace(&request.node_id) {
                self.queue.lock().requeue(request.clone());
            }
        }
        sweep
    }

    fn scan_rechecks(&self, now: DateTime<Utc>) -> usize {
        let next = now + to_delta(self.config.recheck_interval());
        let tier = self.config.priorities.periodic_recheck;
        let mut queued = 0;

        for node_id in self.tracker.due_for_recheck(now) {
            if self
                .enqueue(&node_id, tier, "periodic recheck", now)
                .is_some_and(|outcome| outcome.is_queued())
            {
                queued += 1;
            }
            self.tracker.schedule_recheck(&node_id, next);
        }
        if queued > 0 {
            debug!(queued, "Periodic rechecks queued");
        }
        queued
    }

    fn try_save(&self) -> TopologyResult<()> {
        if !self.config.state_persistence.enabled {
            return Ok(());
        }
        self.persistence.save(&self.tracker.snapshot())
    }

    fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!(error = %e, "Topology state save failed, keeping in-memory state");
        }
    }

    async fn run_queue(self: Arc<Self>, cancel: CancellationToken) {
        let startup = self.config.startup_delay();
        if !startup.is_zero() {
            info!(delay_secs = startup.as_secs(), "Waiting for radio link to settle");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(startup) => {}
            }
        }

        let idle = self.config.idle_sleep();
        loop {
            self.sync_rate();
            let ready = self.health.send_gate(Utc::now()) == SendGate::Allowed
                && !self.queue.lock().is_empty();

            if !ready {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(idle) => continue,
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.limiter.acquire() => {}
            }

            if let SendAttempt::Gated(gate) = self.send_next(Utc::now()) {
                debug!(?gate, "Send gated after token wait");
            }
        }
        debug!("Queue loop exited");
    }

    async fn run_timeout_sweep(self: Arc<Self>, cancel: CancellationToken) {
        run_periodic(self.config.timeout_sweep_interval(), &cancel, || {
            self.sweep_timeouts(Utc::now());
        })
        .await;
        debug!("Timeout sweep loop exited");
    }

    async fn run_rechecks(self: Arc<Self>, cancel: CancellationToken) {
        run_periodic(self.config.recheck_scan_interval(), &cancel, || {
            self.scan_rechecks(Utc::now());
        })
        .await;
        debug!("Recheck loop exited");
    }

    async fn run_autosave(self: Arc<Self>, cancel: CancellationToken) {
        run_periodic(self.config.auto_save_interval(), &cancel, || self.save()).await;
        debug!("Autosave loop exited");
    }
}

async fn run_periodic<F: FnMut()>(period: Duration, cancel: &CancellationToken, mut tick: F) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tick(),
        }
    }
}
