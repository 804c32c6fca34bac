//! Configuration management for Meshgate.
//!
//! Configuration is read once at startup from a TOML file, filled with typed
//! defaults for anything omitted, and validated before any component sees it.
//!
//! ```toml
//! [node]
//! node_id = "!a1b2c3d4"
//!
//! [topology]
//! rate_per_minute = 2.0
//! queue_overflow_strategy = "drop-oldest"
//!
//! [topology.quiet_hours]
//! enabled = true
//! start = "22:00"
//! end = "06:00"
//! timezone = "Europe/Berlin"
//! ```

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::logging::LogFormat;
use crate::types::{is_valid_priority, NodeId};

/// Longest accepted timeout, delay or interval, in seconds (one year).
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway process settings
    pub node: NodeConfig,
    /// Topology-discovery engine settings
    pub topology: TopologyConfig,
}

/// Gateway process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id of the gateway's own radio
    pub node_id: NodeId,
    /// Default log level when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Capacity of the outbound message channel
    pub outbound_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "!gateway".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            outbound_buffer: 256,
        }
    }
}

/// What to do when a probe request arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowStrategy {
    /// Evict the least urgent entry unless the newcomer would be the least urgent
    #[default]
    DropLowestPriority,
    /// Evict the entry that has waited longest
    DropOldest,
    /// Reject the newcomer
    DropNew,
}

/// Topology-discovery engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Master switch for probing (tracking continues when disabled)
    pub enabled: bool,
    /// Probe budget per minute
    pub rate_per_minute: f64,
    /// Bucket capacity as a multiple of the per-minute rate
    pub burst_multiplier: f64,
    /// Maximum queued probe requests
    pub queue_max_size: usize,
    /// Policy applied when the queue is full
    pub queue_overflow_strategy: OverflowStrategy,
    /// Periodically re-trace known indirect nodes
    pub rechecks_enabled: bool,
    /// Hours between re-traces of a node
    pub recheck_interval_hours: f64,
    /// Hop limit stamped on each probe
    pub max_hops: u8,
    /// Seconds to wait for a probe response
    pub timeout_seconds: u64,
    /// Retries after the first attempt times out
    pub max_retries: u32,
    /// Growth factor between successive retry delays
    pub retry_backoff_multiplier: f64,
    /// Delay before the first retry
    pub retry_initial_delay_seconds: u64,
    /// Upper bound for any retry delay
    pub retry_max_delay_seconds: u64,
    /// Settling delay before the first probe after start
    pub startup_delay_seconds: u64,
    /// Enqueue every known indirect node once at start
    pub initial_discovery_enabled: bool,
    /// Never trace nodes heard directly
    pub skip_direct_nodes: bool,
    /// Nodes that are never traced
    pub blacklist: Vec<NodeId>,
    /// When non-empty, only these nodes are traced
    pub whitelist: Vec<NodeId>,
    /// Device roles that are never traced
    pub exclude_roles: Vec<String>,
    /// Minimum SNR (dB) required to trace a node
    pub min_snr_threshold: Option<f32>,
    /// Minutes without a sighting after which a node counts as offline
    pub node_stale_after_minutes: u64,
    /// Seconds between pending-probe timeout sweeps
    pub timeout_sweep_interval_seconds: u64,
    /// Seconds between scans for nodes due a recheck
    pub recheck_scan_interval_seconds: u64,
    /// Sleep of the queue loop when it cannot make progress
    pub idle_sleep_millis: u64,
    /// Priority tiers per trigger
    pub priorities: PriorityConfig,
    /// Daily window with no probing
    pub quiet_hours: QuietHoursConfig,
    /// Throttling on degraded success rate
    pub congestion: CongestionConfig,
    /// Probe halt on severe failure
    pub emergency_stop: EmergencyStopConfig,
    /// State file settings
    pub state_persistence: PersistenceConfig,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_per_minute: 1.0,
            burst_multiplier: 2.0,
            queue_max_size: 100,
            queue_overflow_strategy: OverflowStrategy::DropLowestPriority,
            rechecks_enabled: true,
            recheck_interval_hours: 6.0,
            max_hops: 7,
            timeout_seconds: 60,
            max_retries: 3,
            retry_backoff_multiplier: 2.0,
            retry_initial_delay_seconds: 30,
            retry_max_delay_seconds: 600,
            startup_delay_seconds: 60,
            initial_discovery_enabled: false,
            skip_direct_nodes: true,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            exclude_roles: Vec::new(),
            min_snr_threshold: None,
            node_stale_after_minutes: 120,
            timeout_sweep_interval_seconds: 5,
            recheck_scan_interval_seconds: 60,
            idle_sleep_millis: 1000,
            priorities: PriorityConfig::default(),
            quiet_hours: QuietHoursConfig::default(),
            congestion: CongestionConfig::default(),
            emergency_stop: EmergencyStopConfig::default(),
            state_persistence: PersistenceConfig::default(),
        }
    }
}

/// Priority tier (1 = most urgent) assigned to each enqueue trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// First sighting of an indirect node
    pub new_node: u8,
    /// Operator-requested trace
    pub manual: u8,
    /// Node reappearing after being stale
    pub back_online: u8,
    /// Bulk enqueue at startup
    pub initial_discovery: u8,
    /// Scheduled re-trace
    pub periodic_recheck: u8,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            new_node: 1,
            manual: 2,
            back_online: 4,
            initial_discovery: 6,
            periodic_recheck: 8,
        }
    }
}

/// Daily window during which no probes are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    /// Enable the window
    pub enabled: bool,
    /// Local start time, `HH:MM`
    pub start: String,
    /// Local end time, `HH:MM` (exclusive)
    pub end: String,
    /// IANA timezone name
    pub timezone: String,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "22:00".to_string(),
            end: "06:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// A parsed, validated quiet-hours window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    /// Local start (inclusive)
    pub start: NaiveTime,
    /// Local end (exclusive)
    pub end: NaiveTime,
    /// Zone the times are expressed in
    pub timezone: Tz,
}

impl QuietHoursConfig {
    /// Parse the window, or `None` when quiet hours are disabled.
    pub fn window(&self) -> Result<Option<QuietWindow>> {
        if !self.enabled {
            return Ok(None);
        }

        let start = parse_clock("topology.quiet_hours.start", &self.start)?;
        let end = parse_clock("topology.quiet_hours.end", &self.end)?;
        let timezone: Tz = self.timezone.parse().map_err(|_| {
            CoreError::invalid(
                "topology.quiet_hours.timezone",
                format!("unknown timezone '{}'", self.timezone),
            )
        })?;

        Ok(Some(QuietWindow {
            start,
            end,
            timezone,
        }))
    }
}

/// Throttling applied while the success rate is degraded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// Enable congestion detection
    pub enabled: bool,
    /// Success rate below which the network counts as congested
    pub success_rate_threshold: f64,
    /// Factor applied to the base rate while congested
    pub throttle_multiplier: f64,
    /// Number of recent attempts in the rolling window
    pub window_size: usize,
    /// Attempts required before rate-based transitions apply
    pub min_samples: usize,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            success_rate_threshold: 0.5,
            throttle_multiplier: 0.5,
            window_size: 20,
            min_samples: 10,
        }
    }
}

/// Protective halt of all probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyStopConfig {
    /// Enable emergency stop
    pub enabled: bool,
    /// Success rate below which probing halts
    pub failure_threshold: f64,
    /// Halt once this many consecutive failures are exceeded
    pub consecutive_failures: u32,
    /// Minimum minutes in the stop state before automatic recovery
    pub auto_recovery_minutes: u64,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 0.2,
            consecutive_failures: 10,
            auto_recovery_minutes: 30,
        }
    }
}

/// State file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Persist node state and history
    pub enabled: bool,
    /// Location of the state file
    pub path: PathBuf,
    /// Minutes between automatic saves
    pub auto_save_interval_minutes: u64,
    /// Probe results retained per node
    pub history_per_node: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("data/topology_state.json"),
            auto_save_interval_minutes: 5,
            history_per_node: 10,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can operate with.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(CoreError::invalid("node.node_id", "must not be empty"));
        }
        if self.node.outbound_buffer == 0 {
            return Err(CoreError::invalid("node.outbound_buffer", "must be at least 1"));
        }
        self.topology.validate()
    }
}

impl TopologyConfig {
    /// Reject values no component can operate with.
    pub fn validate(&self) -> Result<()> {
        if !self.rate_per_minute.is_finite() || self.rate_per_minute < 0.0 {
            return Err(CoreError::invalid(
                "topology.rate_per_minute",
                "must be a finite number >= 0",
            ));
        }
        if !self.burst_multiplier.is_finite() || self.burst_multiplier < 1.0 {
            return Err(CoreError::invalid(
                "topology.burst_multiplier",
                "must be a finite number >= 1",
            ));
        }
        if self.queue_max_size == 0 {
            return Err(CoreError::invalid("topology.queue_max_size", "must be at least 1"));
        }
        if !self.recheck_interval_hours.is_finite() || self.recheck_interval_hours <= 0.0 {
            return Err(CoreError::invalid(
                "topology.recheck_interval_hours",
                "must be a positive number",
            ));
        }
        if self.max_hops == 0 || self.max_hops > 7 {
            return Err(CoreError::invalid("topology.max_hops", "must be between 1 and 7"));
        }
        if self.timeout_seconds == 0 {
            return Err(CoreError::invalid("topology.timeout_seconds", "must be at least 1"));
        }
        check_interval("topology.timeout_seconds", Some(self.timeout_seconds))?;
        check_interval(
            "topology.recheck_interval_hours",
            hours_to_secs(self.recheck_interval_hours),
        )?;
        check_interval("topology.startup_delay_seconds", Some(self.startup_delay_seconds))?;
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(CoreError::invalid(
                "topology.retry_backoff_multiplier",
                "must be a finite number >= 1",
            ));
        }
        if self.retry_max_delay_seconds < self.retry_initial_delay_seconds {
            return Err(CoreError::invalid(
                "topology.retry_max_delay_seconds",
                "must not be smaller than retry_initial_delay_seconds",
            ));
        }
        check_interval(
            "topology.retry_max_delay_seconds",
            Some(self.retry_max_delay_seconds),
        )?;
        if let Some(snr) = self.min_snr_threshold {
            if !snr.is_finite() {
                return Err(CoreError::invalid("topology.min_snr_threshold", "must be finite"));
            }
        }
        if self.node_stale_after_minutes == 0 {
            return Err(CoreError::invalid(
                "topology.node_stale_after_minutes",
                "must be at least 1",
            ));
        }
        check_interval(
            "topology.node_stale_after_minutes",
            self.node_stale_after_minutes.checked_mul(60),
        )?;
        if self.timeout_sweep_interval_seconds == 0 {
            return Err(CoreError::invalid(
                "topology.timeout_sweep_interval_seconds",
                "must be at least 1",
            ));
        }
        check_interval(
            "topology.timeout_sweep_interval_seconds",
            Some(self.timeout_sweep_interval_seconds),
        )?;
        if self.recheck_scan_interval_seconds == 0 {
            return Err(CoreError::invalid(
                "topology.recheck_scan_interval_seconds",
                "must be at least 1",
            ));
        }
        check_interval(
            "topology.recheck_scan_interval_seconds",
            Some(self.recheck_scan_interval_seconds),
        )?;
        if self.idle_sleep_millis == 0 {
            return Err(CoreError::invalid("topology.idle_sleep_millis", "must be at least 1"));
        }
        check_interval("topology.idle_sleep_millis", Some(self.idle_sleep_millis / 1000))?;

        let tiers = [
            ("topology.priorities.new_node", self.priorities.new_node),
            ("topology.priorities.manual", self.priorities.manual),
            ("topology.priorities.back_online", self.priorities.back_online),
            ("topology.priorities.initial_discovery", self.priorities.initial_discovery),
            ("topology.priorities.periodic_recheck", self.priorities.periodic_recheck),
        ];
        for (field, tier) in tiers {
            if !is_valid_priority(tier) {
                return Err(CoreError::invalid(field, format!("{} is outside 1..=10", tier)));
            }
        }

        self.quiet_hours.window()?;

        let congestion = &self.congestion;
        check_ratio(
            "topology.congestion.success_rate_threshold",
            congestion.success_rate_threshold,
        )?;
        if !congestion.throttle_multiplier.is_finite()
            || congestion.throttle_multiplier <= 0.0
            || congestion.throttle_multiplier > 1.0
        {
            return Err(CoreError::invalid(
                "topology.congestion.throttle_multiplier",
                "must be in (0, 1]",
            ));
        }
        if congestion.window_size == 0 {
            return Err(CoreError::invalid(
                "topology.congestion.window_size",
                "must be at least 1",
            ));
        }
        if congestion.min_samples == 0 || congestion.min_samples > congestion.window_size {
            return Err(CoreError::invalid(
                "topology.congestion.min_samples",
                "must be between 1 and window_size",
            ));
        }

        let stop = &self.emergency_stop;
        check_ratio("topology.emergency_stop.failure_threshold", stop.failure_threshold)?;
        if stop.consecutive_failures == 0 {
            return Err(CoreError::invalid(
                "topology.emergency_stop.consecutive_failures",
                "must be at least 1",
            ));
        }
        check_interval(
            "topology.emergency_stop.auto_recovery_minutes",
            stop.auto_recovery_minutes.checked_mul(60),
        )?;

        let persistence = &self.state_persistence;
        if persistence.enabled && persistence.path.as_os_str().is_empty() {
            return Err(CoreError::invalid(
                "topology.state_persistence.path",
                "must not be empty when persistence is enabled",
            ));
        }
        if persistence.auto_save_interval_minutes == 0 {
            return Err(CoreError::invalid(
                "topology.state_persistence.auto_save_interval_minutes",
                "must be at least 1",
            ));
        }
        check_interval(
            "topology.state_persistence.auto_save_interval_minutes",
            persistence.auto_save_interval_minutes.checked_mul(60),
        )?;
        if persistence.history_per_node == 0 {
            return Err(CoreError::invalid(
                "topology.state_persistence.history_per_node",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Response deadline for a single probe.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Interval between re-traces of the same node.
    pub fn recheck_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.recheck_interval_hours * 3600.0).unwrap_or(Duration::MAX)
    }

    /// Settling delay before the first probe.
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_seconds)
    }

    /// Age after which an unseen node counts as offline.
    pub fn node_stale_after(&self) -> Duration {
        Duration::from_secs(self.node_stale_after_minutes.saturating_mul(60))
    }

    /// Delay before the first retry.
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_secs(self.retry_initial_delay_seconds)
    }

    /// Upper bound for retry delays.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_seconds)
    }

    /// Period of the timeout sweep loop.
    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_sweep_interval_seconds)
    }

    /// Period of the recheck scan loop.
    pub fn recheck_scan_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_scan_interval_seconds)
    }

    /// Sleep of the queue loop when idle or gated.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_millis)
    }

    /// Period of the autosave loop.
    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.state_persistence.auto_save_interval_minutes.saturating_mul(60))
    }

    /// Minimum dwell in emergency stop before auto recovery.
    pub fn auto_recovery_interval(&self) -> Duration {
        Duration::from_secs(self.emergency_stop.auto_recovery_minutes.saturating_mul(60))
    }
}

fn parse_clock(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| CoreError::invalid(field, format!("'{}' is not a HH:MM time", value)))
}

fn hours_to_secs(hours: f64) -> Option<u64> {
    let secs = hours * 3600.0;
    (0.0..=MAX_INTERVAL_SECS as f64)
        .contains(&secs)
        .then_some(secs as u64)
}

fn check_interval(field: &str, secs: Option<u64>) -> Result<()> {
    match secs {
        Some(secs) if secs <= MAX_INTERVAL_SECS => Ok(()),
        _ => Err(CoreError::invalid(field, "must not exceed one year")),
    }
}

fn check_ratio(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::invalid(field, "must be within [0, 1]"))
    }
}
