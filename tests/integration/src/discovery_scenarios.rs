//! Discovery Scenarios - Event handling through the full engine
//!
//! # Test Scenarios
//!
//! 1. **Direct-node exclusion**: direct neighbors never reach the queue
//! 2. **Trigger priorities**: new node, manual, back-online tiers interleave correctly
//! 3. **Full trace lifecycle**: probe, response, history, recheck
//! 4. **Filter precedence**: blacklist overrides whitelist
//! 5. **Forwarding**: overheard probe traffic is republished verbatim
//! 6. **Queue overflow**: drop-lowest-priority rejects or evicts at the engine boundary

use chrono::TimeDelta;
use meshgate_core::{
    MeshEvent, NodeObservation, OutboundMessage, OverflowStrategy, TracerouteRequestPacket,
    TRACEROUTE_APP,
};
use meshgate_topology::{SendAttempt, TopologyError};

use crate::test_utils::{response, seen, seen_with, t0, MeshHarness};

#[test]
fn test_direct_nodes_never_queued() {
    let h = MeshHarness::new(|_| {});
    let mut now = t0();

    // Deterministic churn of nodes flipping between direct and indirect
    for step in 0u32..200 {
        let node = format!("!{:08x}", step % 17);
        let is_direct = (step * 7 + step / 3) % 5 < 2;
        h.engine.handle_event_at(&seen(&node, is_direct), now);
        now += TimeDelta::seconds(20);

        for request in h.engine.queued() {
            let state = h.engine.node(&request.node_id).unwrap();
            assert!(
                !state.is_direct,
                "direct node {} found in queue",
                request.node_id
            );
        }
    }
}

#[test]
fn test_trigger_priorities_interleave() {
    let h = MeshHarness::new(|_| {});
    let start = t0();

    h.engine.handle_event_at(&seen("!a", false), start);
    h.engine.handle_event_at(&seen("!c", false), start);
    h.trace("!a", &["!r1"], start);
    h.trace("!c", &[], start);

    // Past the two-hour stale threshold
    let later = start + TimeDelta::hours(3);
    h.engine.handle_event_at(&seen("!a", false), later);
    h.engine.handle_event_at(&seen("!b", false), later);
    h.engine.request_trace("!c").unwrap();

    let order: Vec<(String, u8)> = h
        .engine
        .queued()
        .into_iter()
        .map(|r| (r.node_id, r.priority))
        .collect();
    assert_eq!(
        order,
        vec![
            ("!b".to_string(), 1),
            ("!c".to_string(), 2),
            ("!a".to_string(), 4),
        ]
    );
}

#[test]
fn test_full_trace_lifecycle() {
    let mut h = MeshHarness::new(|_| {});
    let now = t0();

    h.engine.handle_event_at(
        &seen_with(NodeObservation::new("!0000beef", false).with_signal(Some(-7.5), Some(-118))),
        now,
    );
    let request_id = h.send_expecting("!0000beef", now);

    let probes = h.probes();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].port, TRACEROUTE_APP);
    assert_eq!(probes[0].hop_limit, 7);
    assert_eq!(probes[0].request_id, request_id);

    let answer = response("!0000beef", request_id, &["!00000001", "!00000002"]);
    h.engine
        .handle_event_at(&answer, now + TimeDelta::seconds(12));
    assert_eq!(h.drain(), vec![OutboundMessage::Forward(answer)]);

    let history = h.engine.history("!0000beef");
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].route, vec!["!00000001", "!00000002"]);
    assert_eq!(history[0].hop_count, 3);
    assert_eq!(history[0].duration_ms, 12_000);

    let state = h.engine.node("!0000beef").unwrap();
    assert_eq!(state.trace_count, 1);
    assert_eq!(state.snr, Some(-7.5));
    assert_eq!(
        state.next_recheck,
        Some(now + TimeDelta::seconds(12) + TimeDelta::hours(6))
    );

    assert_eq!(h.engine.scan_rechecks(now + TimeDelta::hours(7)), 1);
    assert_eq!(h.engine.queued()[0].reason, "periodic recheck");
}

#[test]
fn test_blacklist_overrides_whitelist() {
    let h = MeshHarness::new(|config| {
        config.whitelist = vec!["!both".to_string(), "!white".to_string()];
        config.blacklist = vec!["!both".to_string()];
    });

    for node in ["!both", "!white", "!neither"] {
        h.engine.handle_event_at(&seen(node, false), t0());
    }

    let queued: Vec<String> = h.engine.queued().into_iter().map(|r| r.node_id).collect();
    assert_eq!(queued, vec!["!white".to_string()]);
    assert!(matches!(
        h.engine.request_trace("!both"),
        Err(TopologyError::NotTraceable { .. })
    ));
}

#[test]
fn test_excluded_role_and_weak_signal_filtered() {
    let h = MeshHarness::new(|config| {
        config.exclude_roles = vec!["client_mute".to_string()];
        config.min_snr_threshold = Some(-10.0);
    });

    let now = t0();
    h.engine.handle_event_at(
        &seen_with(
            NodeObservation::new("!muted", false)
                .with_signal(Some(3.0), None)
                .with_role("CLIENT_MUTE"),
        ),
        now,
    );
    h.engine.handle_event_at(
        &seen_with(NodeObservation::new("!faint", false).with_signal(Some(-15.0), None)),
        now,
    );
    h.engine.handle_event_at(
        &seen_with(NodeObservation::new("!clear", false).with_signal(Some(-2.0), None)),
        now,
    );

    let queued: Vec<String> = h.engine.queued().into_iter().map(|r| r.node_id).collect();
    assert_eq!(queued, vec!["!clear".to_string()]);
}

#[test]
fn test_overheard_traffic_forwarded_but_not_matched() {
    let mut h = MeshHarness::new(|_| {});
    let now = t0();

    let request = MeshEvent::TracerouteRequest(TracerouteRequestPacket {
        from: NodeObservation::new("!other", true),
        to: "!far".to_string(),
        request_id: Some(77),
        hop_limit: 5,
    });
    let foreign_answer = response("!far", 77, &["!relay"]);

    h.engine.handle_event_at(&request, now);
    h.engine.handle_event_at(&foreign_answer, now);

    assert_eq!(
        h.drain(),
        vec![
            OutboundMessage::Forward(request),
            OutboundMessage::Forward(foreign_answer),
        ]
    );
    assert!(h.engine.history("!far").is_empty());
    // The responder was still discovered as a new indirect node
    assert_eq!(h.engine.queued()[0].node_id, "!far");
}

#[test]
fn test_became_indirect_requeued_at_back_online_tier() {
    let h = MeshHarness::new(|_| {});
    let now = t0();

    h.engine.handle_event_at(&seen("!hop", true), now);
    assert!(h.engine.queued().is_empty());

    h.engine
        .handle_event_at(&seen("!hop", false), now + TimeDelta::minutes(5));
    let queued = h.engine.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].priority, 4);
}

#[test]
fn test_direct_transition_cancels_pending_probe() {
    let h = MeshHarness::new(|_| {});
    let now = t0();

    h.engine.handle_event_at(&seen("!mover", false), now);
    h.send_expecting("!mover", now);
    assert!(h.engine.is_pending("!mover"));

    h.engine.handle_event_at(&seen("!mover", true), now);
    assert!(!h.engine.is_pending("!mover"));
    assert_eq!(h.engine.status_at(now).pending_probes, 0);

    // A late timeout sweep finds nothing to retry
    assert!(h.engine.sweep_timeouts(now + TimeDelta::minutes(5)).is_empty());
}

#[test]
fn test_queue_overflow_rejects_least_urgent_newcomer() {
    let h = MeshHarness::new(|config| {
        config.queue_max_size = 2;
        config.queue_overflow_strategy = OverflowStrategy::DropLowestPriority;
    });
    let start = t0();

    h.engine.handle_event_at(&seen("!old", false), start);
    h.trace("!old", &[], start);

    h.engine.handle_event_at(&seen("!x", false), start);
    h.engine.handle_event_at(&seen("!y", false), start);
    // Recheck tier 8 is worse than both new-node entries: rejected
    assert_eq!(h.engine.scan_rechecks(start + TimeDelta::hours(6)), 0);

    h.engine
        .handle_event_at(&seen("!z", false), start + TimeDelta::hours(6));
    let status = h.engine.status_at(start);
    assert_eq!(status.queue_size, 2);
    assert_eq!(status.queue.rejected, 2);

    let queued: Vec<String> = h.engine.queued().into_iter().map(|r| r.node_id).collect();
    assert_eq!(queued, vec!["!x".to_string(), "!y".to_string()]);
}

#[test]
fn test_queue_overflow_evicts_least_urgent() {
    let h = MeshHarness::new(|config| {
        config.queue_max_size = 2;
        config.queue_overflow_strategy = OverflowStrategy::DropLowestPriority;
    });
    let start = t0();
    for node in ["!p", "!q"] {
        h.engine.handle_event_at(&seen(node, false), start);
        h.trace(node, &[], start);
    }

    let due = start + TimeDelta::hours(6);
    assert_eq!(h.engine.scan_rechecks(due), 2);

    // A new node outranks both rechecks; the later recheck is evicted
    h.engine.handle_event_at(&seen("!z", false), due);
    let status = h.engine.status_at(due);
    assert_eq!(status.queue_size, 2);
    assert_eq!(status.queue.evicted, 1);
    assert_eq!(status.queue.rejected, 0);

    let queued: Vec<(String, u8)> = h
        .engine
        .queued()
        .into_iter()
        .map(|r| (r.node_id, r.priority))
        .collect();
    assert_eq!(
        queued,
        vec![("!z".to_string(), 1), ("!p".to_string(), 8)]
    );
}

#[test]
fn test_idle_queue_reports_idle() {
    let h = MeshHarness::new(|_| {});
    assert_eq!(h.engine.try_send_next(t0()), SendAttempt::Idle);
}
