//! Mesh event schema shared across the dispatch boundary.
//!
//! Inbound traffic is already decoded from the radio's packet format by the
//! transport layer; what arrives here is a tagged, structured [`MeshEvent`].
//! Outbound traffic is either a fresh [`ProbeRequest`] emitted by the
//! topology engine or a verbatim forward of observed probe traffic.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Mesh application port used for route-discovery (traceroute) packets.
pub const TRACEROUTE_APP: u32 = 70;

/// A sighting of a node, as reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeObservation {
    /// Sender node id
    pub node_id: NodeId,
    /// Heard directly (zero hops away) rather than through relays
    pub is_direct: bool,
    /// Signal-to-noise ratio of the received packet (dB)
    #[serde(default)]
    pub snr: Option<f32>,
    /// Received signal strength (dBm)
    #[serde(default)]
    pub rssi: Option<i32>,
    /// Device role announced by the node, when known
    #[serde(default)]
    pub role: Option<String>,
}

impl NodeObservation {
    /// Observation with no signal or role information.
    pub fn new(node_id: impl Into<NodeId>, is_direct: bool) -> Self {
        Self {
            node_id: node_id.into(),
            is_direct,
            snr: None,
            rssi: None,
            role: None,
        }
    }

    /// Attach signal quality.
    pub fn with_signal(mut self, snr: Option<f32>, rssi: Option<i32>) -> Self {
        self.snr = snr;
        self.rssi = rssi;
        self
    }

    /// Attach a device role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// One relay hop reported in a route-discovery response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Relaying node id
    pub node_id: NodeId,
    /// SNR measured at this hop (dB)
    #[serde(default)]
    pub snr: Option<f32>,
    /// RSSI measured at this hop (dBm)
    #[serde(default)]
    pub rssi: Option<i32>,
}

/// A route-discovery request seen on the mesh (ours or another node's).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteRequestPacket {
    /// Originating node
    pub from: NodeObservation,
    /// Destination node
    pub to: NodeId,
    /// Packet id of the request
    #[serde(default)]
    pub request_id: Option<u32>,
    /// Hop limit the request was sent with
    pub hop_limit: u8,
}

/// A route-discovery response seen on the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteResponsePacket {
    /// Responding node (the traced destination)
    pub from: NodeObservation,
    /// Node that asked for the trace
    pub to: NodeId,
    /// Packet id of the request this answers, when the radio reports it
    #[serde(default)]
    pub request_id: Option<u32>,
    /// Relays between requester and destination, in path order
    #[serde(default)]
    pub route: Vec<RouteHop>,
    /// Relays on the way back, in path order
    #[serde(default)]
    pub route_back: Vec<RouteHop>,
}

/// Inbound mesh event delivered by the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// Any packet or neighbor-info update revealing a node
    NodeSeen(NodeObservation),
    /// Route-discovery request observed on the mesh
    TracerouteRequest(TracerouteRequestPacket),
    /// Route-discovery response observed on the mesh
    TracerouteResponse(TracerouteResponsePacket),
}

impl MeshEvent {
    /// The observation of the node that sent this event.
    pub fn sender(&self) -> &NodeObservation {
        match self {
            MeshEvent::NodeSeen(observation) => observation,
            MeshEvent::TracerouteRequest(packet) => &packet.from,
            MeshEvent::TracerouteResponse(packet) => &packet.from,
        }
    }

    /// Whether this is probe traffic that must be forwarded downstream.
    pub fn is_probe_traffic(&self) -> bool {
        !matches!(self, MeshEvent::NodeSeen(_))
    }
}

/// Probe emitted by the topology engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    /// Node to trace
    pub destination: NodeId,
    /// Application port; always [`TRACEROUTE_APP`]
    pub port: u32,
    /// Ask the destination to reply
    pub want_response: bool,
    /// Maximum relays the probe may traverse
    pub hop_limit: u8,
    /// Correlation id echoed back in the response
    pub request_id: u32,
}

impl ProbeRequest {
    /// Build a route-discovery probe towards `destination`.
    pub fn traceroute(destination: impl Into<NodeId>, hop_limit: u8, request_id: u32) -> Self {
        Self {
            destination: destination.into(),
            port: TRACEROUTE_APP,
            want_response: true,
            hop_limit,
            request_id,
        }
    }
}

/// Message leaving the engine through a channel-style dispatch boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Probe to transmit on the radio
    Probe(ProbeRequest),
    /// Observed probe traffic to publish unchanged
    Forward(MeshEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_request_sets_traceroute_fields() {
        let probe = ProbeRequest::traceroute("!deadbeef", 7, 42);

        assert_eq!(probe.destination, "!deadbeef");
        assert_eq!(probe.port, TRACEROUTE_APP);
        assert!(probe.want_response);
        assert_eq!(probe.hop_limit, 7);
        assert_eq!(probe.request_id, 42);
    }

    #[test]
    fn test_mesh_event_tagged_json() {
        let json = r#"{
            "type": "traceroute_response",
            "from": { "node_id": "!0000beef", "is_direct": false, "snr": 4.5 },
            "to": "!gateway",
            "request_id": 9,
            "route": [ { "node_id": "!00000001", "snr": 6.0, "rssi": -90 } ]
        }"#;

        let event: MeshEvent = serde_json::from_str(json).unwrap();
        match &event {
            MeshEvent::TracerouteResponse(packet) => {
                assert_eq!(packet.from.node_id, "!0000beef");
                assert_eq!(packet.request_id, Some(9));
                assert_eq!(packet.route.len(), 1);
                assert!(packet.route_back.is_empty());
            }
            other => panic!("Expected TracerouteResponse, got {:?}", other),
        }
        assert!(event.is_probe_traffic());
        assert_eq!(event.sender().snr, Some(4.5));
    }

    #[test]
    fn test_node_seen_is_not_probe_traffic() {
        let event = MeshEvent::NodeSeen(
            NodeObservation::new("!00000002", true)
                .with_signal(Some(-3.0), Some(-110))
                .with_role("ROUTER"),
        );

        assert!(!event.is_probe_traffic());
        assert_eq!(event.sender().role.as_deref(), Some("ROUTER"));
    }

    #[test]
    fn test_outbound_message_serialization() {
        let message = OutboundMessage::Probe(ProbeRequest::traceroute("!00000003", 5, 1));
        let json = serde_json::to_string(&message).unwrap();

        assert!(json.contains("\"kind\":\"probe\""));
        let back: OutboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
