//! Integration tests for the Meshgate topology engine
//!
//! This test suite validates:
//! - Discovery triggers, filters and forwarding through the full engine
//! - Rate pacing of the running queue loop on a paused clock
//! - Quiet hours, congestion throttling and emergency stop gating
//! - State persistence across engine restarts

pub mod test_utils;

#[cfg(test)]
mod discovery_scenarios;

#[cfg(test)]
mod gating_scenarios;

#[cfg(test)]
mod persistence_scenarios;
