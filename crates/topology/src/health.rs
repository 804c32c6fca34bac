//! Network Health Monitoring - Congestion throttling and emergency stop
//!
//! A rolling window of the most recent probe outcomes drives a three-state
//! machine. Quiet hours are evaluated separately and block sends in any state.
//!
//! ```text
//! Healthy ──rate < congestion──▶ Congested ──rate recovers──▶ Healthy
//!    │                              │
//!    └──rate < stop OR streak > N───┴──▶ EmergencyStop ──dwell + recent rate──▶ Healthy
//! ```

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use meshgate_core::{CongestionConfig, EmergencyStopConfig, QuietWindow, TopologyConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{error, info, warn};

use crate::clock::to_delta;
use crate::error::TopologyResult;

/// Recent success rate must exceed the stop threshold by this factor to recover.
const RECOVERY_FACTOR: f64 = 1.5;

/// Logical network health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Sending at the base rate
    Healthy,
    /// Sending at a throttled rate
    Congested,
    /// No sends
    EmergencyStop,
}

/// Whether a probe may be sent right now, and if not, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGate {
    /// Sending permitted
    Allowed,
    /// Probing disabled by configuration
    Disabled,
    /// Inside the configured quiet window
    QuietHours,
    /// Emergency stop in effect
    EmergencyStop,
}

/// Health counters exposed through the status query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Current state
    pub state: HealthState,
    /// Probes sent since start
    pub total_sent: u64,
    /// Probes answered since start
    pub total_succeeded: u64,
    /// Probes failed since start
    pub total_failed: u64,
    /// Current failure streak
    pub consecutive_failures: u32,
    /// Success rate over the rolling window, if it holds any outcome
    pub window_success_rate: Option<f64>,
    /// Outcomes in the rolling window
    pub window_samples: usize,
    /// When the current emergency stop began
    pub stopped_since: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct HealthInner {
    state: HealthState,
    window: VecDeque<(DateTime<Utc>, bool)>,
    consecutive_failures: u32,
    total_sent: u64,
    total_succeeded: u64,
    total_failed: u64,
    stopped_at: Option<DateTime<Utc>>,
}

impl HealthInner {
    fn window_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let ok = self.window.iter().filter(|(_, success)| *success).count();
        Some(ok as f64 / self.window.len() as f64)
    }

    fn recent_rate(&self, since: DateTime<Utc>) -> f64 {
        let recent: Vec<bool> = self
            .window
            .iter()
            .filter(|(at, _)| *at > since)
            .map(|(_, success)| *success)
            .collect();
        if recent.is_empty() {
            return 1.0;
        }
        recent.iter().filter(|success| **success).count() as f64 / recent.len() as f64
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.consecutive_failures = 0;
    }
}

/// Tracks probe outcomes and decides whether and how fast to send.
#[derive(Debug)]
pub struct NetworkHealthMonitor {
    inner: Mutex<HealthInner>,
    enabled: bool,
    congestion: CongestionConfig,
    emergency: EmergencyStopConfig,
    quiet: Option<QuietWindow>,
    recovery_after: TimeDelta,
}

impl NetworkHealthMonitor {
    /// Create a monitor in the healthy state.
    pub fn new(config: &TopologyConfig) -> TopologyResult<Self> {
        Ok(Self {
            inner: Mutex::new(HealthInner {
                state: HealthState::Healthy,
                window: VecDeque::with_capacity(config.congestion.window_size),
                consecutive_failures: 0,
                total_sent: 0,
                total_succeeded: 0,
                total_failed: 0,
                stopped_at: None,
            }),
            enabled: config.enabled,
            congestion: config.congestion.clone(),
            emergency: config.emergency_stop.clone(),
            quiet: config.quiet_hours.window()?,
            recovery_after: to_delta(config.auto_recovery_interval()),
        })
    }

    /// Count a probe handed to the dispatch boundary.
    pub fn record_sent(&self) {
        self.inner.lock().total_sent += 1;
    }

    /// Record an answered probe.
    pub fn record_success(&self, now: DateTime<Utc>) -> HealthState {
        self.record(now, true)
    }

    /// Record a probe that failed permanently or timed out.
    pub fn record_failure(&self, now: DateTime<Utc>) -> HealthState {
        self.record(now, false)
    }

    fn record(&self, now: DateTime<Utc>, success: bool) -> HealthState {
        let mut inner = self.inner.lock();
        if inner.window.len() >= self.congestion.window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back((now, success));
        if success {
            inner.total_succeeded += 1;
            inner.consecutive_failures = 0;
        } else {
            inner.total_failed += 1;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        }
        self.transition(&mut inner, now)
    }

    /// Re-evaluate the state machine, including timed recovery.
    pub fn evaluate(&self, now: DateTime<Utc>) -> HealthState {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, now)
    }

    fn transition(&self, inner: &mut HealthInner, now: DateTime<Utc>) -> HealthState {
        let enough = inner.window.len() >= self.congestion.min_samples;
        let rate = inner.window_rate().unwrap_or(1.0);

        match inner.state {
            HealthState::EmergencyStop => {
                let Some(stopped_at) = inner.stopped_at else {
                    inner.state = HealthState::Healthy;
                    return inner.state;
                };
                if now - stopped_at < self.recovery_after {
                    return inner.state;
                }
                let recent = inner.recent_rate(now - self.recovery_after);
                if recent > self.emergency.failure_threshold * RECOVERY_FACTOR {
                    info!(
                        recent_success_rate = recent,
                        stopped_for_secs = (now - stopped_at).num_seconds(),
                        "Emergency stop lifted, probing resumes"
                    );
                    inner.state = HealthState::Healthy;
                    inner.stopped_at = None;
                    inner.clear_window();
                }
            }
            current => {
                let streak_exceeded =
                    inner.consecutive_failures > self.emergency.consecutive_failures;
                let rate_collapsed = enough && rate < self.emergency.failure_threshold;

                if self.emergency.enabled && (streak_exceeded || rate_collapsed) {
                    error!(
                        alert = true,
                        consecutive_failures = inner.consecutive_failures,
                        window_success_rate = rate,
                        "Emergency stop: probing halted"
                    );
                    inner.state = HealthState::EmergencyStop;
                    inner.stopped_at = Some(now);
                } else if self.congestion.enabled
                    && enough
                    && rate < self.congestion.success_rate_threshold
                {
                    if current != HealthState::Congested {
                        warn!(window_success_rate = rate, "Mesh congested, throttling probes");
                        inner.state = HealthState::Congested;
                    }
                } else if current == HealthState::Congested
                    && (!self.congestion.enabled || enough)
                {
                    info!(window_success_rate = rate, "Mesh congestion cleared");
                    inner.state = HealthState::Healthy;
                }
            }
        }
        inner.state
    }

    /// Current state without re-evaluation.
    pub fn state(&self) -> HealthState {
        self.inner.lock().state
    }

    /// Whether `now` falls inside the configured quiet window.
    pub fn is_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        let Some(window) = &self.quiet else {
            return false;
        };
        let local = now.with_timezone(&window.timezone).time();
        in_window(window.start, window.end, local)
    }

    /// Send rate appropriate for the current state.
    pub fn recommended_rate(&self, base_rate: f64) -> f64 {
        match self.state() {
            HealthState::Congested => base_rate * self.congestion.throttle_multiplier,
            HealthState::Healthy | HealthState::EmergencyStop => base_rate,
        }
    }

    /// Combined gate: configuration, emergency stop, then quiet hours.
    pub fn send_gate(&self, now: DateTime<Utc>) -> SendGate {
        if !self.enabled {
            return SendGate::Disabled;
        }
        if self.evaluate(now) == HealthState::EmergencyStop {
            return SendGate::EmergencyStop;
        }
        if self.is_quiet_hours(now) {
            return SendGate::QuietHours;
        }
        SendGate::Allowed
    }

    /// Manual override: return to healthy and forget the rolling window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != HealthState::Healthy {
            info!(from = ?inner.state, "Network health manually reset");
        }
        inner.state = HealthState::Healthy;
        inner.stopped_at = None;
        inner.clear_window();
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> HealthMetrics {
        let inner = self.inner.lock();
        HealthMetrics {
            state: inner.state,
            total_sent: inner.total_sent,
            total_succeeded: inner.total_succeeded,
            total_failed: inner.total_failed,
            consecutive_failures: inner.consecutive_failures,
            window_success_rate: inner.window_rate(),
            window_samples: inner.window.len(),
            stopped_since: inner.stopped_at,
        }
    }
}

/// Half-open `[start, end)`, wrapping past midnight when `end < start`.
fn in_window(start: NaiveTime, end: NaiveTime, time: NaiveTime) -> bool {
    if start == end {
        false
    } else if start < end {
        start <= time && time < end
    } else {
        time >= start || time < end
    }
}
