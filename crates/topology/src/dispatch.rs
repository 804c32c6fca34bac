//! Dispatch boundary between the engine and the radio transport.
//!
//! The engine never talks to the radio directly: probes it wants sent and
//! probe traffic it observed both leave through a [`MeshDispatcher`].

use meshgate_core::{MeshEvent, OutboundMessage, ProbeRequest};
use tokio::sync::mpsc;

use crate::error::{TopologyError, TopologyResult};

/// Outbound side of the dispatch boundary.
///
/// Implementations must not block: the engine calls them from its loops and
/// from the inbound event path.
pub trait MeshDispatcher: Send + Sync {
    /// Hand a probe to the transport for transmission.
    fn send_probe(&self, probe: ProbeRequest) -> TopologyResult<()>;

    /// Publish observed probe traffic unchanged.
    fn forward(&self, event: &MeshEvent) -> TopologyResult<()>;
}

/// Dispatcher backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiver draining it.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Wrap an existing sender.
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    fn push(&self, message: OutboundMessage) -> TopologyResult<()> {
        self.tx.try_send(message).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "outbound channel full",
                mpsc::error::TrySendError::Closed(_) => "outbound channel closed",
            };
            TopologyError::Dispatch(reason.to_string())
        })
    }
}

impl MeshDispatcher for ChannelDispatcher {
    fn send_probe(&self, probe: ProbeRequest) -> TopologyResult<()> {
        self.push(OutboundMessage::Probe(probe))
    }

    fn forward(&self, event: &MeshEvent) -> TopologyResult<()> {
        self.push(OutboundMessage::Forward(event.clone()))
    }
}
