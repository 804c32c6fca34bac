//! Error types for Meshgate topology discovery.
//!
//! None of these are fatal to the gateway: callers log them and degrade
//! (skip a probe, lose forwarding, start from empty state).

use thiserror::Error;

/// Errors that can occur in topology-discovery operations.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The dispatch boundary refused or could not accept a message
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A probe is already in flight for this node
    #[error("Traceroute already pending for {node_id}")]
    AlreadyPending {
        /// Node with the in-flight probe
        node_id: String,
    },

    /// Node fails the trace filters
    #[error("Node {node_id} is not traceable: {reason}")]
    NotTraceable {
        /// Filtered node
        node_id: String,
        /// Filter that rejected it
        reason: String,
    },

    /// State file errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// State file carries a format version this build cannot read
    #[error("Unsupported state file version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the file
        found: u32,
        /// Version this build writes
        expected: u32,
    },

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] meshgate_core::CoreError),

    /// Operation requires a running engine
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;
