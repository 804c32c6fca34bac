//! Node State Tracking - Reachability and trace eligibility per mesh node
//!
//! Every node id ever observed gets exactly one [`NodeState`]. States are
//! updated in place and never removed: a node that stops transmitting just
//! ages out of "recently seen".

use chrono::{DateTime, TimeDelta, Utc};
use meshgate_core::{NodeId, NodeObservation, TopologyConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::clock::to_delta;

/// Everything the gateway knows about one mesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Node identifier
    pub node_id: NodeId,
    /// Heard directly on the last observation
    pub is_direct: bool,
    /// Last observation time
    pub last_seen: Option<DateTime<Utc>>,
    /// Completion time of the last trace attempt
    pub last_traced: Option<DateTime<Utc>>,
    /// When the node is next due a periodic re-trace
    pub next_recheck: Option<DateTime<Utc>>,
    /// Outcome of the last trace attempt
    pub last_trace_succeeded: bool,
    /// Completed trace attempts
    pub trace_count: u64,
    /// Failed trace attempts
    pub failure_count: u64,
    /// Last reported SNR (dB)
    pub snr: Option<f32>,
    /// Last reported RSSI (dBm)
    pub rssi: Option<i32>,
    /// Reappeared after being stale and not traced since
    pub was_offline: bool,
    /// Announced device role
    pub role: Option<String>,
}

impl NodeState {
    fn first_seen(observation: &NodeObservation, now: DateTime<Utc>) -> Self {
        Self {
            node_id: observation.node_id.clone(),
            is_direct: observation.is_direct,
            last_seen: Some(now),
            last_traced: None,
            next_recheck: None,
            last_trace_succeeded: false,
            trace_count: 0,
            failure_count: 0,
            snr: observation.snr,
            rssi: observation.rssi,
            was_offline: false,
            role: observation.role.clone(),
        }
    }
}

/// What an observation changed about a node.
///
/// When several apply, the earliest variant listed wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTransition {
    /// Never observed before
    NewNode,
    /// Was indirect, now heard directly
    BecameDirect,
    /// Was stale, now seen again
    BackOnline,
    /// Was direct, now only heard through relays
    BecameIndirect,
    /// Nothing notable
    Refreshed,
}

/// Outcome of the trace filters for one node, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDecision {
    /// Node may be traced
    Allowed,
    /// Never observed
    Unknown,
    /// A whitelist exists and the node is not on it
    NotWhitelisted,
    /// Node is blacklisted
    Blacklisted,
    /// Node announces an excluded role
    ExcludedRole,
    /// SNR missing or below the configured floor
    WeakSignal,
    /// Node is a direct neighbor
    Direct,
}

/// Per-classification node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
    /// Nodes heard directly
    pub direct: usize,
    /// Nodes heard through relays
    pub indirect: usize,
    /// All known nodes
    pub total: usize,
}

/// Static filter set compiled from configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    whitelist: HashSet<NodeId>,
    blacklist: HashSet<NodeId>,
    exclude_roles: HashSet<String>,
    min_snr: Option<f32>,
    skip_direct: bool,
}

impl NodeFilter {
    /// Build the filter from the engine configuration.
    pub fn from_config(config: &TopologyConfig) -> Self {
        Self {
            whitelist: config.whitelist.iter().cloned().collect(),
            blacklist: config.blacklist.iter().cloned().collect(),
            exclude_roles: config
                .exclude_roles
                .iter()
                .map(|role| role.to_ascii_uppercase())
                .collect(),
            min_snr: config.min_snr_threshold,
            skip_direct: config.skip_direct_nodes,
        }
    }

    fn decide(&self, state: &NodeState) -> TraceDecision {
        if !self.whitelist.is_empty() && !self.whitelist.contains(&state.node_id) {
            return TraceDecision::NotWhitelisted;
        }
        if self.blacklist.contains(&state.node_id) {
            return TraceDecision::Blacklisted;
        }
        if let Some(role) = &state.role {
            if self.exclude_roles.contains(&role.to_ascii_uppercase()) {
                return TraceDecision::ExcludedRole;
            }
        }
        if let Some(floor) = self.min_snr {
            match state.snr {
                Some(snr) if snr >= floor => {}
                _ => return TraceDecision::WeakSignal,
            }
        }
        if self.skip_direct && state.is_direct {
            return TraceDecision::Direct;
        }
        TraceDecision::Allowed
    }
}

/// Thread-safe registry of [`NodeState`]s.
#[derive(Debug)]
pub struct NodeStateTracker {
    nodes: Mutex<HashMap<NodeId, NodeState>>,
    filter: NodeFilter,
    stale_after: TimeDelta,
    recheck_interval: Option<TimeDelta>,
}

impl NodeStateTracker {
    /// Create a tracker configured from the engine settings.
    pub fn new(config: &TopologyConfig) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            filter: NodeFilter::from_config(config),
            stale_after: to_delta(config.node_stale_after()),
            recheck_interval: config
                .rechecks_enabled
                .then(|| to_delta(config.recheck_interval())),
        }
    }

    /// Record an observation, creating the node on first sight.
    pub fn update(&self, observation: &NodeObservation, now: DateTime<Utc>) -> NodeTransition {
        let mut nodes = self.nodes.lock();

        let Some(state) = nodes.get_mut(&observation.node_id) else {
            nodes.insert(
                observation.node_id.clone(),
                NodeState::first_seen(observation, now),
            );
            info!(
                node_id = %observation.node_id,
                is_direct = observation.is_direct,
                "New mesh node observed"
            );
            return NodeTransition::NewNode;
        };

        let was_stale = match state.last_seen {
            Some(seen) => now - seen > self.stale_after,
            None => true,
        };
        let was_direct = state.is_direct;

        state.is_direct = observation.is_direct;
        state.last_seen = Some(now);
        if observation.snr.is_some() {
            state.snr = observation.snr;
        }
        if observation.rssi.is_some() {
            state.rssi = observation.rssi;
        }
        if observation.role.is_some() {
            state.role = observation.role.clone();
        }
        if was_stale {
            state.was_offline = true;
        }

        let transition = if !was_direct && observation.is_direct {
            NodeTransition::BecameDirect
        } else if was_stale {
            NodeTransition::BackOnline
        } else if was_direct && !observation.is_direct {
            NodeTransition::BecameIndirect
        } else {
            NodeTransition::Refreshed
        };

        if transition != NodeTransition::Refreshed {
            info!(node_id = %observation.node_id, ?transition, "Node reachability changed");
        }
        transition
    }

    /// Run the trace filters for a node.
    pub fn trace_decision(&self, node_id: &str) -> TraceDecision {
        let nodes = self.nodes.lock();
        let decision = match nodes.get(node_id) {
            Some(state) => self.filter.decide(state),
            None => TraceDecision::Unknown,
        };
        if decision != TraceDecision::Allowed {
            debug!(node_id = %node_id, ?decision, "Node filtered from tracing");
        }
        decision
    }

    /// Whether the node passes every trace filter.
    pub fn should_trace(&self, node_id: &str) -> bool {
        self.trace_decision(node_id) == TraceDecision::Allowed
    }

    /// Record a completed trace attempt.
    ///
    /// Returns `false` if the node is unknown.
    pub fn mark_traced(&self, node_id: &str, success: bool, now: DateTime<Utc>) -> bool {
        let mut nodes = self.nodes.lock();
        let Some(state) = nodes.get_mut(node_id) else {
            return false;
        };

        state.last_traced = Some(now);
        state.last_trace_succeeded = success;
        state.trace_count += 1;
        if !success {
            state.failure_count += 1;
        }
        state.was_offline = false;
        state.next_recheck = self.recheck_interval.map(|interval| now + interval);
        true
    }

    /// Set the next periodic re-trace time for a node.
    pub fn schedule_recheck(&self, node_id: &str, at: DateTime<Utc>) {
        if let Some(state) = self.nodes.lock().get_mut(node_id) {
            state.next_recheck = Some(at);
        }
    }

    /// Nodes whose periodic re-trace time has passed, sorted by id.
    pub fn due_for_recheck(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let nodes = self.nodes.lock();
        let mut due: Vec<NodeId> = nodes
            .values()
            .filter(|state| state.next_recheck.is_some_and(|at| at <= now))
            .map(|state| state.node_id.clone())
            .collect();
        due.sort();
        due
    }

    /// All nodes currently classified as indirect, sorted by id.
    pub fn indirect_nodes(&self) -> Vec<NodeId> {
        let nodes = self.nodes.lock();
        let mut indirect: Vec<NodeId> = nodes
            .values()
            .filter(|state| !state.is_direct)
            .map(|state| state.node_id.clone())
            .collect();
        indirect.sort();
        indirect
    }

    /// Direct/indirect/total counts.
    pub fn counts(&self) -> NodeCounts {
        let nodes = self.nodes.lock();
        let direct = nodes.values().filter(|state| state.is_direct).count();
        NodeCounts {
            direct,
            indirect: nodes.len() - direct,
            total: nodes.len(),
        }
    }

    /// Copy of a single node's state.
    pub fn get(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.lock().get(node_id).cloned()
    }

    /// Copy of every node's state.
    pub fn snapshot(&self) -> HashMap<NodeId, NodeState> {
        self.nodes.lock().clone()
    }

    /// Load persisted states; nodes already observed this run are kept.
    pub fn restore(&self, states: HashMap<NodeId, NodeState>) -> usize {
        let mut nodes = self.nodes.lock();
        let mut restored = 0;
        for (node_id, state) in states {
            nodes.entry(node_id).or_insert_with(|| {
                restored += 1;
                state
            });
        }
        restored
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Whether no node has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}
