//! Persistence Scenarios - Engine restarts over a shared state directory
//!
//! # Test Scenarios
//!
//! 1. **Warm restart**: node states and history survive stop/start
//! 2. **Initial discovery**: restored indirect nodes are queued once at start
//! 3. **Corrupt state**: the file is moved aside and the engine starts cold
//! 4. **Persistence disabled**: no file is written

use chrono::Utc;
use meshgate_topology::STATE_VERSION;
use std::fs;

use crate::test_utils::{seen, state_path, t0, MeshHarness};

#[tokio::test]
async fn test_warm_restart_restores_nodes_and_history() {
    let h = MeshHarness::new(|_| {});
    h.engine.start().unwrap();

    let now = Utc::now();
    h.engine.handle_event_at(&seen("!near", true), now);
    h.engine.handle_event_at(&seen("!far", false), now);
    h.engine.stop().await;

    let document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(state_path(h.state_dir.path())).unwrap()).unwrap();
    assert_eq!(document["version"], STATE_VERSION);
    assert!(document["nodes"]["!far"].is_object());
    assert!(document["nodes"]["!far"]["last_traced"].is_null());

    let before_far = h.engine.node("!far").unwrap();
    let restarted = h.restart(|_| {}).await;
    restarted.engine.start().unwrap();

    assert_eq!(restarted.engine.node("!far").unwrap(), before_far);
    assert!(restarted.engine.node("!near").unwrap().is_direct);
    assert_eq!(restarted.engine.status().nodes.total, 2);
    restarted.engine.stop().await;
}

#[tokio::test]
async fn test_history_survives_restart() {
    let h = MeshHarness::new(|_| {});
    let now = t0();
    h.engine.handle_event_at(&seen("!far", false), now);
    h.trace("!far", &["!relay"], now);
    h.engine.save().unwrap();

    let restarted = h.restart(|_| {}).await;
    restarted.engine.start().unwrap();

    let history = restarted.engine.history("!far");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].route, vec!["!relay"]);
    assert!(restarted.engine.node("!far").unwrap().last_trace_succeeded);
    restarted.engine.stop().await;
}

#[tokio::test]
async fn test_initial_discovery_queues_restored_indirect_nodes() {
    let h = MeshHarness::new(|_| {});
    let now = t0();
    for (node, direct) in [("!d1", true), ("!i1", false), ("!i2", false)] {
        h.engine.handle_event_at(&seen(node, direct), now);
    }
    h.engine.save().unwrap();

    let restarted = h
        .restart(|config| {
            config.initial_discovery_enabled = true;
            // Keep the loop from draining the queue during the assertions
            config.startup_delay_seconds = 3600;
        })
        .await;
    restarted.engine.start().unwrap();

    let queued: Vec<(String, u8)> = restarted
        .engine
        .queued()
        .into_iter()
        .map(|r| (r.node_id, r.priority))
        .collect();
    assert_eq!(
        queued,
        vec![("!i1".to_string(), 6), ("!i2".to_string(), 6)]
    );

    restarted.engine.stop().await;
    assert!(restarted.engine.queued().is_empty());
}

#[tokio::test]
async fn test_corrupt_state_starts_cold() {
    let h = MeshHarness::new(|_| {});
    let path = state_path(h.state_dir.path());
    fs::write(&path, b"{\"version\": 1, \"nodes\": [truncated").unwrap();

    h.engine.start().unwrap();
    assert_eq!(h.engine.status().nodes.total, 0);

    let backups = fs::read_dir(h.state_dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("topology_state.json.corrupt-")
        })
        .count();
    assert_eq!(backups, 1);

    h.engine.stop().await;
    // The final save writes a fresh, readable document
    let document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(document["version"], STATE_VERSION);
}

#[tokio::test]
async fn test_persistence_disabled_writes_nothing() {
    let h = MeshHarness::new(|config| config.state_persistence.enabled = false);
    h.engine.start().unwrap();
    h.engine.handle_event_at(&seen("!far", true), t0());
    h.engine.save().unwrap();
    h.engine.stop().await;

    assert!(!state_path(h.state_dir.path()).exists());
}
