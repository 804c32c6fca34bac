//! Core functionality for the Meshgate mesh radio gateway.
//!
//! This crate provides the fundamental types, configuration, error handling
//! and logging used across the Meshgate workspace, plus the mesh event model
//! exchanged over the dispatch boundary.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod types;

pub use config::{
    CongestionConfig, Config, EmergencyStopConfig, NodeConfig, OverflowStrategy,
    PersistenceConfig, PriorityConfig, QuietHoursConfig, QuietWindow, TopologyConfig,
};
pub use error::{CoreError, Result};
pub use event::{
    MeshEvent, NodeObservation, OutboundMessage, ProbeRequest, RouteHop,
    TracerouteRequestPacket, TracerouteResponsePacket, TRACEROUTE_APP,
};
pub use logging::LogFormat;
pub use types::{NodeId, PRIORITY_DEFAULT, PRIORITY_HIGHEST, PRIORITY_LOWEST};
