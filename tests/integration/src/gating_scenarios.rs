//! Gating Scenarios - Rate limiting, quiet hours and network health
//!
//! # Test Scenarios
//!
//! 1. **Rate pacing**: the running queue loop spaces probes by the token refill
//! 2. **Quiet hours**: boundary instants around a midnight-spanning window
//! 3. **Emergency stop**: sustained timeouts halt probing until auto-recovery
//! 4. **Congestion**: degraded success rate throttles the effective rate

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use meshgate_core::OutboundMessage;
use meshgate_topology::{HealthState, SendAttempt, SendGate};
use std::time::Duration;
use tokio::time::Instant;

use crate::test_utils::{seen, t0, MeshHarness};

#[tokio::test(start_paused = true)]
async fn test_running_engine_paces_probes() {
    let mut h = MeshHarness::new(|config| {
        config.rate_per_minute = 1.0;
        config.burst_multiplier = 1.0;
    });
    h.engine.start().unwrap();

    for i in 0..5 {
        h.engine.handle_event(&seen(&format!("!n{}", i), false));
    }

    let start = Instant::now();
    let mut arrivals = Vec::new();
    while arrivals.len() < 5 {
        match h.outbound.recv().await {
            Some(OutboundMessage::Probe(probe)) => arrivals.push((probe.destination, start.elapsed())),
            Some(OutboundMessage::Forward(_)) => {}
            None => panic!("Outbound channel closed"),
        }
    }
    h.engine.stop().await;

    let order: Vec<&str> = arrivals.iter().map(|(node, _)| node.as_str()).collect();
    assert_eq!(order, vec!["!n0", "!n1", "!n2", "!n3", "!n4"]);

    assert!(arrivals[0].1 < Duration::from_secs(1));
    for pair in arrivals.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(60));
    }
}

fn utc(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, day, h, m, 0).unwrap()
}

#[test]
fn test_quiet_hours_boundaries() {
    let h = MeshHarness::new(|config| {
        config.quiet_hours.enabled = true;
        config.quiet_hours.start = "22:00".to_string();
        config.quiet_hours.end = "06:00".to_string();
        config.quiet_hours.timezone = "UTC".to_string();
    });
    for i in 0..3 {
        h.engine.handle_event_at(&seen(&format!("!q{}", i), false), utc(15, 21, 0));
    }

    assert!(matches!(h.engine.try_send_next(utc(15, 21, 59)), SendAttempt::Sent { .. }));
    assert_eq!(
        h.engine.try_send_next(utc(15, 22, 0)),
        SendAttempt::Gated(SendGate::QuietHours)
    );
    assert_eq!(
        h.engine.try_send_next(utc(16, 5, 59)),
        SendAttempt::Gated(SendGate::QuietHours)
    );
    assert!(matches!(h.engine.try_send_next(utc(16, 6, 0)), SendAttempt::Sent { .. }));
    assert_eq!(h.engine.queued().len(), 1);
}

#[test]
fn test_quiet_hours_in_local_timezone() {
    // New York in June is UTC-4: 22:00 local is 02:00 UTC
    let h = MeshHarness::new(|config| {
        config.quiet_hours.enabled = true;
        config.quiet_hours.timezone = "America/New_York".to_string();
    });
    h.engine.handle_event_at(&seen("!ny", false), utc(15, 1, 0));

    assert!(!h.engine.status_at(utc(16, 1, 59)).quiet_hours);
    assert!(h.engine.status_at(utc(16, 2, 0)).quiet_hours);
    assert_eq!(
        h.engine.try_send_next(utc(16, 9, 59)),
        SendAttempt::Gated(SendGate::QuietHours)
    );
    assert!(matches!(h.engine.try_send_next(utc(16, 10, 0)), SendAttempt::Sent { .. }));
}

#[test]
fn test_emergency_stop_and_auto_recovery() {
    let h = MeshHarness::new(|config| {
        config.max_retries = 0;
    });
    let mut now = t0();

    for i in 0..10 {
        let node = format!("!dead{}", i);
        h.engine.handle_event_at(&seen(&node, false), now);
        h.send_expecting(&node, now);
        now += TimeDelta::seconds(61);
        h.engine.sweep_timeouts(now);
    }

    let status = h.engine.status_at(now);
    assert!(status.emergency_stop);
    assert!(!status.healthy);
    assert_eq!(status.total_failed, 10);

    h.engine.handle_event_at(&seen("!waiting", false), now);
    assert_eq!(
        h.engine.try_send_next(now + TimeDelta::minutes(29)),
        SendAttempt::Gated(SendGate::EmergencyStop)
    );
    assert_eq!(h.engine.queued().len(), 1);

    h.send_expecting("!waiting", now + TimeDelta::minutes(30));
    assert_eq!(
        h.engine.status_at(now).health_state,
        HealthState::Healthy
    );
}

#[test]
fn test_congestion_throttles_effective_rate() {
    let h = MeshHarness::new(|config| {
        config.max_retries = 0;
        config.rate_per_minute = 600.0;
    });
    let mut now = t0();

    for i in 0..4 {
        let node = format!("!ok{}", i);
        h.engine.handle_event_at(&seen(&node, false), now);
        h.trace(&node, &[], now);
    }
    for i in 0..6 {
        let node = format!("!lost{}", i);
        h.engine.handle_event_at(&seen(&node, false), now);
        h.send_expecting(&node, now);
        now += TimeDelta::seconds(61);
        h.engine.sweep_timeouts(now);
    }

    assert_eq!(h.engine.try_send_next(now), SendAttempt::Idle);
    let status = h.engine.status_at(now);
    assert!(status.throttled);
    assert_eq!(status.health_state, HealthState::Congested);
    assert_eq!(status.effective_rate, 300.0);
    assert_eq!(status.success_rate, Some(0.4));
}

#[test]
fn test_disabled_engine_tracks_but_never_sends() {
    let h = MeshHarness::new(|config| config.enabled = false);

    h.engine.handle_event_at(&seen("!quiet", false), t0());
    assert!(h.engine.node("!quiet").is_some());
    assert_eq!(
        h.engine.try_send_next(t0()),
        SendAttempt::Gated(SendGate::Disabled)
    );
    assert!(!h.engine.status_at(t0()).enabled);
}
