//! Meshgate Topology - Automated route discovery for the mesh gateway
//!
//! Watches mesh traffic for nodes, decides which ones need tracing, and sends
//! route-discovery probes at a pace the shared radio channel can absorb.
//!
//! # Core Components
//!
//! - **Node State Tracking**: reachability, signal and trace eligibility per node
//! - **Probe Queue**: bounded, deduplicated, priority-then-FIFO ordering
//! - **Rate Limiting**: token bucket pacing of outbound probes
//! - **Network Health**: congestion throttling, emergency stop, quiet hours
//! - **Traceroute Lifecycle**: correlation, timeouts, exponential-backoff retries
//! - **State Persistence**: atomic JSON state file with bounded trace history
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshgate_core::{MeshEvent, NodeObservation, TopologyConfig};
//! use meshgate_topology::{ChannelDispatcher, TopologyEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (dispatcher, mut outbound) = ChannelDispatcher::channel(256);
//! let engine = TopologyEngine::new(TopologyConfig::default(), Arc::new(dispatcher))?;
//! engine.start()?;
//!
//! engine.handle_event(&MeshEvent::NodeSeen(NodeObservation::new("!a1b2c3d4", false)));
//! while let Some(message) = outbound.recv().await {
//!     println!("{:?}", message);
//! }
//!
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod clock;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod node_state;
pub mod orchestrator;
pub mod persistence;
pub mod queue;
pub mod rate_limiter;
pub mod traceroute;

pub use dispatch::{ChannelDispatcher, MeshDispatcher};
pub use error::{TopologyError, TopologyResult};
pub use health::{HealthMetrics, HealthState, NetworkHealthMonitor, SendGate};
pub use node_state::{
    NodeCounts, NodeFilter, NodeState, NodeStateTracker, NodeTransition, TraceDecision,
};
pub use orchestrator::{SendAttempt, TopologyEngine, TopologyStatus};
pub use persistence::{PersistedState, StatePersistence, STATE_VERSION};
pub use queue::{EnqueueOutcome, PriorityQueue, QueueStats, TracerouteRequest};
pub use rate_limiter::RateLimiter;
pub use traceroute::{
    PendingTraceroute, ResponseOutcome, RetryPolicy, ScheduledRetry, TimeoutSweep,
    TracerouteManager, TracerouteResult,
};
