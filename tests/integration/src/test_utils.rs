//! Test utilities for engine-level integration tests

use chrono::{DateTime, TimeZone, Utc};
use meshgate_core::{
    MeshEvent, NodeObservation, OutboundMessage, ProbeRequest, RouteHop, TopologyConfig,
    TracerouteResponsePacket,
};
use meshgate_topology::{ChannelDispatcher, SendAttempt, TopologyEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Route test logs through the test harness when `RUST_LOG` is set
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Fixed reference instant, well outside the default quiet window
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
}

/// Baseline engine configuration for tests: fast rate, no startup delay,
/// state file inside `dir`
pub fn base_config(dir: &Path) -> TopologyConfig {
    let mut config = TopologyConfig::default();
    config.rate_per_minute = 600.0;
    config.startup_delay_seconds = 0;
    config.idle_sleep_millis = 10;
    config.state_persistence.path = state_path(dir);
    config
}

/// State file location used by [`base_config`]
pub fn state_path(dir: &Path) -> PathBuf {
    dir.join("topology_state.json")
}

/// Node sighting event
pub fn seen(node_id: &str, is_direct: bool) -> MeshEvent {
    MeshEvent::NodeSeen(NodeObservation::new(node_id, is_direct))
}

/// Node sighting with signal and role details
pub fn seen_with(observation: NodeObservation) -> MeshEvent {
    MeshEvent::NodeSeen(observation)
}

/// Traceroute response from `node_id` through the given relays
pub fn response(node_id: &str, request_id: u32, relays: &[&str]) -> MeshEvent {
    MeshEvent::TracerouteResponse(TracerouteResponsePacket {
        from: NodeObservation::new(node_id, false),
        to: "!gateway".to_string(),
        request_id: Some(request_id),
        route: relays
            .iter()
            .map(|relay| RouteHop {
                node_id: relay.to_string(),
                snr: Some(5.0),
                rssi: Some(-98),
            })
            .collect(),
        route_back: Vec::new(),
    })
}

/// Engine wired to a channel dispatcher, with its state directory
pub struct MeshHarness {
    pub engine: TopologyEngine,
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub config: TopologyConfig,
    pub state_dir: TempDir,
}

impl MeshHarness {
    /// Build an engine over [`base_config`] adjusted by `configure`
    pub fn new(configure: impl FnOnce(&mut TopologyConfig)) -> Self {
        let state_dir = TempDir::new().unwrap();
        Self::with_state_dir(state_dir, configure)
    }

    /// Build an engine keeping its state in an existing directory
    pub fn with_state_dir(state_dir: TempDir, configure: impl FnOnce(&mut TopologyConfig)) -> Self {
        init_test_logging();
        let mut config = base_config(state_dir.path());
        configure(&mut config);

        let (dispatcher, outbound) = ChannelDispatcher::channel(1024);
        let engine = TopologyEngine::new(config.clone(), Arc::new(dispatcher)).unwrap();
        Self {
            engine,
            outbound,
            config,
            state_dir,
        }
    }

    /// Stop the engine and bring up a fresh one over the same state directory
    pub async fn restart(self, configure: impl FnOnce(&mut TopologyConfig)) -> Self {
        self.engine.stop().await;
        Self::with_state_dir(self.state_dir, configure)
    }

    /// Everything emitted so far
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        std::iter::from_fn(|| self.outbound.try_recv().ok()).collect()
    }

    /// Probes emitted so far, discarding forwarded traffic
    pub fn probes(&mut self) -> Vec<ProbeRequest> {
        self.drain()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Probe(probe) => Some(probe),
                OutboundMessage::Forward(_) => None,
            })
            .collect()
    }

    /// Send the next queued probe, asserting it targets `node_id`
    pub fn send_expecting(&self, node_id: &str, now: DateTime<Utc>) -> u32 {
        match self.engine.try_send_next(now) {
            SendAttempt::Sent {
                node_id: sent,
                request_id,
            } => {
                assert_eq!(sent, node_id, "unexpected probe target");
                request_id
            }
            other => panic!("Expected probe to {}, got {:?}", node_id, other),
        }
    }

    /// Send the next probe to `node_id` and answer it through `relays`
    pub fn trace(&self, node_id: &str, relays: &[&str], now: DateTime<Utc>) {
        let request_id = self.send_expecting(node_id, now);
        self.engine
            .handle_event_at(&response(node_id, request_id, relays), now);
    }
}
