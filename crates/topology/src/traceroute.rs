//! Traceroute Lifecycle - Send, correlate, time out, retry
//!
//! Every probe in flight has one [`PendingTraceroute`], keyed by request id
//! and indexed by node. Timed-out probes are either parked as a
//! [`ScheduledRetry`] with exponential backoff or finalized as failures.

use chrono::{DateTime, TimeDelta, Utc};
use meshgate_core::{NodeId, ProbeRequest, RouteHop, TopologyConfig, TracerouteResponsePacket};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{elapsed, to_delta};
use crate::dispatch::MeshDispatcher;
use crate::error::{TopologyError, TopologyResult};
use crate::queue::TracerouteRequest;

/// Physically plausible SNR range (dB).
const SNR_BOUNDS: (f32, f32) = (-50.0, 50.0);

/// Physically plausible RSSI range (dBm).
const RSSI_BOUNDS: (i32, i32) = (-200, 0);

/// Outcome of one trace, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteResult {
    /// Traced node
    pub node_id: NodeId,
    /// Request id of the final attempt
    pub request_id: u32,
    /// Whether a well-formed route came back
    pub success: bool,
    /// Relay node ids in path order
    pub route: Vec<NodeId>,
    /// SNR per relay, parallel to `route`
    pub snr: Vec<Option<f32>>,
    /// RSSI per relay, parallel to `route`
    pub rssi: Vec<Option<i32>>,
    /// Radio hops from gateway to node
    pub hop_count: usize,
    /// Time from send to completion of the final attempt
    pub duration_ms: u64,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// Retries spent before the final attempt
    pub retry_count: u32,
    /// Failure description
    pub error: Option<String>,
}

impl TracerouteResult {
    fn failed(
        pending: &PendingTraceroute,
        now: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            node_id: pending.node_id.clone(),
            request_id: pending.request_id,
            success: false,
            route: Vec::new(),
            snr: Vec::new(),
            rssi: Vec::new(),
            hop_count: 0,
            duration_ms: elapsed(pending.sent_at, now).as_millis() as u64,
            completed_at: now,
            retry_count: pending.retry_count,
            error: Some(error.into()),
        }
    }
}

/// A probe awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTraceroute {
    /// Probed node
    pub node_id: NodeId,
    /// Correlation id stamped on the probe
    pub request_id: u32,
    /// Send time
    pub sent_at: DateTime<Utc>,
    /// Response deadline
    pub deadline: DateTime<Utc>,
    /// Retries already spent
    pub retry_count: u32,
    /// Retries allowed before the trace fails for good
    pub max_retries: u32,
    /// Queue tier the probe came from
    pub priority: u8,
    /// Why the trace was requested
    pub reason: String,
}

/// A timed-out trace waiting out its backoff delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    /// Request to put back on the queue
    pub request: TracerouteRequest,
    /// Earliest time the retry may be queued
    pub due_at: DateTime<Utc>,
}

/// How an inbound response was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// Matched a pending probe and produced a route
    Completed(TracerouteResult),
    /// Matched a pending probe but the route was unusable
    Malformed(TracerouteResult),
    /// No pending probe matches; traffic from someone else's trace
    Unsolicited,
}

/// Report of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeoutSweep {
    /// Nodes whose probe timed out and got a retry, with the backoff delay
    pub retries_scheduled: Vec<(NodeId, Duration)>,
    /// Traces that exhausted their retries
    pub failures: Vec<TracerouteResult>,
    /// Retries whose backoff elapsed, ready to queue
    pub due_retries: Vec<TracerouteRequest>,
}

impl TimeoutSweep {
    /// Whether the sweep found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.retries_scheduled.is_empty() && self.failures.is_empty() && self.due_retries.is_empty()
    }
}

/// Exponential backoff schedule for retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before retry 1
    pub initial_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Delay cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Build from engine configuration.
    pub fn from_config(config: &TopologyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.retry_initial_delay(),
            multiplier: config.retry_backoff_multiplier,
            max_delay: config.retry_max_delay(),
        }
    }

    /// Delay before retry `attempt` (1-based): `min(initial × multiplier^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Default)]
struct PendingTable {
    by_request: HashMap<u32, PendingTraceroute>,
    by_node: HashMap<NodeId, u32>,
    retries: HashMap<NodeId, ScheduledRetry>,
}

impl PendingTable {
    fn take(&mut self, request_id: u32) -> Option<PendingTraceroute> {
        let pending = self.by_request.remove(&request_id)?;
        self.by_node.remove(&pending.node_id);
        Some(pending)
    }

    fn fresh_request_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..=u32::MAX);
            if !self.by_request.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Owns the pending-probe table and the retry schedule.
pub struct TracerouteManager {
    table: Mutex<PendingTable>,
    dispatcher: Arc<dyn MeshDispatcher>,
    max_hops: u8,
    timeout: TimeDelta,
    policy: RetryPolicy,
}

impl std::fmt::Debug for TracerouteManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerouteManager")
            .field("max_hops", &self.max_hops)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl TracerouteManager {
    /// Create a manager emitting probes through `dispatcher`.
    pub fn new(config: &TopologyConfig, dispatcher: Arc<dyn MeshDispatcher>) -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
            dispatcher,
            max_hops: config.max_hops,
            timeout: to_delta(config.timeout()),
            policy: RetryPolicy::from_config(config),
        }
    }

    /// Emit a probe for `request` and track it until answered or timed out.
    ///
    /// Refused when the node already has a probe in flight. A dispatch
    /// failure leaves nothing pending.
    pub fn send(&self, request: &TracerouteRequest, now: DateTime<Utc>) -> TopologyResult<u32> {
        let request_id = {
            let mut table = self.table.lock();
            if table.by_node.contains_key(&request.node_id) {
                return Err(TopologyError::AlreadyPending {
                    node_id: request.node_id.clone(),
                });
            }
            let request_id = table.fresh_request_id();
            table.retries.remove(&request.node_id);
            table.by_node.insert(request.node_id.clone(), request_id);
            table.by_request.insert(
                request_id,
                PendingTraceroute {
                    node_id: request.node_id.clone(),
                    request_id,
                    sent_at: now,
                    deadline: now + self.timeout,
                    retry_count: request.retry_count,
                    max_retries: self.policy.max_retries,
                    priority: request.priority,
                    reason: request.reason.clone(),
                },
            );
            request_id
        };

        let probe = ProbeRequest::traceroute(request.node_id.clone(), self.max_hops, request_id);
        if let Err(e) = self.dispatcher.send_probe(probe) {
            self.table.lock().take(request_id);
            return Err(e);
        }

        info!(
            node_id = %request.node_id,
            request_id,
            priority = request.priority,
            retry = request.retry_count,
            reason = %request.reason,
            "Traceroute sent"
        );
        Ok(request_id)
    }

    /// Correlate a response with its pending probe.
    ///
    /// Matches by request id, or by responding node when the id is absent.
    pub fn handle_response(
        &self,
        packet: &TracerouteResponsePacket,
        now: DateTime<Utc>,
    ) -> ResponseOutcome {
        let pending = {
            let mut table = self.table.lock();
            let request_id = match packet.request_id {
                Some(id) => Some(id),
                None => table.by_node.get(&packet.from.node_id).copied(),
            };
            match request_id {
                Some(id) => table.take(id),
                None => None,
            }
        };

        let Some(pending) = pending else {
            debug!(
                node_id = %packet.from.node_id,
                request_id = ?packet.request_id,
                "Traceroute response matches no pending probe"
            );
            return ResponseOutcome::Unsolicited;
        };

        if let Err(reason) = validate_route(&packet.route) {
            warn!(
                node_id = %pending.node_id,
                request_id = pending.request_id,
                reason = %reason,
                "Malformed traceroute response discarded"
            );
            return ResponseOutcome::Malformed(TracerouteResult::failed(
                &pending,
                now,
                format!("malformed route: {}", reason),
            ));
        }

        let result = TracerouteResult {
            node_id: pending.node_id.clone(),
            request_id: pending.request_id,
            success: true,
            route: packet.route.iter().map(|hop| hop.node_id.clone()).collect(),
            snr: packet.route.iter().map(|hop| hop.snr).collect(),
            rssi: packet.route.iter().map(|hop| hop.rssi).collect(),
            hop_count: packet.route.len() + 1,
            duration_ms: elapsed(pending.sent_at, now).as_millis() as u64,
            completed_at: now,
            retry_count: pending.retry_count,
            error: None,
        };
        info!(
            node_id = %result.node_id,
            request_id = result.request_id,
            hops = result.hop_count,
            duration_ms = result.duration_ms,
            "Traceroute completed"
        );
        ResponseOutcome::Completed(result)
    }

    /// Expire overdue probes and release retries whose backoff elapsed.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> TimeoutSweep {
        let mut sweep = TimeoutSweep::default();
        let mut table = self.table.lock();

        let expired: Vec<u32> = table
            .by_request
            .values()
            .filter(|pending| pending.deadline <= now)
            .map(|pending| pending.request_id)
            .collect();

        for request_id in expired {
            let Some(pending) = table.take(request_id) else {
                continue;
            };

            if pending.retry_count < pending.max_retries {
                let attempt = pending.retry_count + 1;
                let delay = self.policy.backoff_delay(attempt);
                debug!(
                    node_id = %pending.node_id,
                    request_id,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    "Traceroute timed out, retry scheduled"
                );
                let retry = ScheduledRetry {
                    request: TracerouteRequest {
                        node_id: pending.node_id.clone(),
                        priority: pending.priority,
                        reason: pending.reason.clone(),
                        enqueued_at: now,
                        retry_count: attempt,
                    },
                    due_at: now + to_delta(delay),
                };
                table.retries.insert(pending.node_id.clone(), retry);
                sweep.retries_scheduled.push((pending.node_id, delay));
            } else {
                warn!(
                    node_id = %pending.node_id,
                    request_id,
                    retries = pending.retry_count,
                    "Traceroute failed permanently"
                );
                sweep.failures.push(TracerouteResult::failed(
                    &pending,
                    now,
                    format!("no response after {} retries", pending.retry_count),
                ));
            }
        }

        let due: Vec<NodeId> = table
            .retries
            .values()
            .filter(|retry| retry.due_at <= now)
            .map(|retry| retry.request.node_id.clone())
            .collect();
        for node_id in due {
            if let Some(retry) = table.retries.remove(&node_id) {
                sweep.due_retries.push(retry.request);
            }
        }
        sweep.due_retries.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        sweep
    }

    /// Drop the pending probe and any scheduled retry for a node.
    pub fn cancel(&self, node_id: &str) -> bool {
        let mut table = self.table.lock();
        let had_retry = table.retries.remove(node_id).is_some();
        let had_pending = match table.by_node.get(node_id).copied() {
            Some(request_id) => table.take(request_id).is_some(),
            None => false,
        };
        if had_pending || had_retry {
            debug!(node_id = %node_id, "Traceroute cancelled");
        }
        had_pending || had_retry
    }

    /// Whether a probe is in flight for the node.
    pub fn is_pending(&self, node_id: &str) -> bool {
        self.table.lock().by_node.contains_key(node_id)
    }

    /// Copy of the node's in-flight probe.
    pub fn pending_for(&self, node_id: &str) -> Option<PendingTraceroute> {
        let table = self.table.lock();
        let request_id = table.by_node.get(node_id)?;
        table.by_request.get(request_id).cloned()
    }

    /// Probes in flight.
    pub fn pending_count(&self) -> usize {
        self.table.lock().by_request.len()
    }

    /// Retries waiting out their backoff.
    pub fn scheduled_retry_count(&self) -> usize {
        self.table.lock().retries.len()
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Abandon every pending probe and scheduled retry.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.by_request.clear();
        table.by_node.clear();
        table.retries.clear();
    }
}

fn validate_route(route: &[RouteHop]) -> Result<(), String> {
    for (index, hop) in route.iter().enumerate() {
        if hop.node_id.trim().is_empty() {
            return Err(format!("hop {} has no node id", index));
        }
        if let Some(snr) = hop.snr {
            if !snr.is_finite() || snr < SNR_BOUNDS.0 || snr > SNR_BOUNDS.1 {
                return Err(format!("hop {} snr {} out of range", index, snr));
            }
        }
        if let Some(rssi) = hop.rssi {
            if rssi < RSSI_BOUNDS.0 || rssi > RSSI_BOUNDS.1 {
                return Err(format!("hop {} rssi {} out of range", index, rssi));
            }
        }
    }
    Ok(())
}
