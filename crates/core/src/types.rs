//! Core types

/// Unique identifier for a node in the mesh (e.g. `!a1b2c3d4`)
pub type NodeId = String;

/// Most urgent probe priority tier
pub const PRIORITY_HIGHEST: u8 = 1;

/// Least urgent probe priority tier
pub const PRIORITY_LOWEST: u8 = 10;

/// Tier substituted for out-of-range priority values
pub const PRIORITY_DEFAULT: u8 = 5;

/// Whether `priority` is inside the valid `[1, 10]` tier range.
pub fn is_valid_priority(priority: u8) -> bool {
    (PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&priority)
}
