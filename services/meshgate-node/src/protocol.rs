//! JSON-lines protocol spoken on stdin/stdout.
//!
//! Each stdin line is either a [`MeshEvent`] (tagged by `type`) or an
//! operator [`ControlCommand`] (tagged by `command`). Each stdout line is
//! either an `OutboundMessage` (tagged by `kind`) or a [`ControlReply`]
//! (tagged by `reply`).

use meshgate_core::{MeshEvent, NodeId};
use meshgate_topology::TopologyStatus;
use serde::{Deserialize, Serialize};

pub const NODE_PROTOCOL_VERSION: u32 = 1;
pub const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
pub struct NodeVersionHandshake {
    pub version: &'static str,
    pub runtime_version: u32,
    pub protocol_version: u32,
}

impl NodeVersionHandshake {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        }
    }
}

/// Operator commands accepted alongside mesh events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Report the engine status
    Status,
    /// Queue a manual trace
    Trace { node_id: NodeId },
    /// Lift an emergency stop
    ResetEmergencyStop,
    /// Write the state file now
    Save,
}

impl ControlCommand {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Trace { .. } => "trace",
            Self::ResetEmergencyStop => "reset_emergency_stop",
            Self::Save => "save",
        }
    }
}

/// Answer to a [`ControlCommand`], written to stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    /// Current engine status
    Status(TopologyStatus),
    /// Command carried out
    Ok { command: &'static str },
    /// Command refused or failed
    Error { command: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    Event(MeshEvent),
    Command(ControlCommand),
}

/// Parse one stdin line; `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<InboundLine>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("command").is_some() {
        Ok(Some(InboundLine::Command(serde_json::from_value(value)?)))
    } else {
        Ok(Some(InboundLine::Event(serde_json::from_value(value)?)))
    }
}

/// Encode one stdout line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
