mod common;

use common::*;
use manifold::types::*;
use std::time::Duration;

fn short_intervals(h: &Harness) {
    h.config
        .update_health_check_config(&HealthCheckConfig {
            check_interval_seconds: 1,
            check_timeout_seconds: 1,
            default_cooldown_seconds: 1,
        })
        .unwrap();
}

#[tokio::test]
async fn test_scheduled_probe_recovers_target() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    short_intervals(&h);

    // Default mock outcome is a successful probe.
    h.states.start_cooldown_timed("t1");
    h.health.schedule_target_check("t1");

    tokio::time::sleep(Duration::from_millis(1400)).await;

    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Healthy);
    assert!(state.cooldown_ends_at.is_none());
    assert_eq!(h.health.live_timer_count(), 0);
}

#[tokio::test]
async fn test_failed_probe_on_active_route_stays_timed() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    short_intervals(&h);

    for _ in 0..4 {
        h.dispatcher
            .queue(&cred_id("t1"), MockOutcome::Status(500, "still down".into()));
    }

    // Activity within the 20s window keeps the probe cadence going.
    h.activity.mark(&h.route.id);

    h.states.start_cooldown_timed("t1");
    h.health.schedule_target_check("t1");

    tokio::time::sleep(Duration::from_millis(1400)).await;

    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Cooling);
    assert!(state.cooldown_ends_at.is_some(), "should stay timed");
    assert_eq!(h.health.live_timer_count(), 1);

    h.health.stop();
}

#[tokio::test]
async fn test_failed_probe_on_idle_route_goes_untimed() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    short_intervals(&h);

    h.dispatcher
        .queue(&cred_id("t1"), MockOutcome::Status(500, "still down".into()));

    // No activity on the route: after the failed probe the target is
    // parked until the next request.
    h.states.start_cooldown_timed("t1");
    h.health.schedule_target_check("t1");

    tokio::time::sleep(Duration::from_millis(1400)).await;

    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Cooling);
    assert!(state.cooldown_ends_at.is_none(), "should be untimed");
    assert_eq!(h.health.live_timer_count(), 0);
}

#[tokio::test]
async fn test_schedule_twice_leaves_one_timer() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);

    h.states.start_cooldown_timed("t1");
    h.health.schedule_target_check("t1");
    h.health.schedule_target_check("t1");

    assert_eq!(h.health.live_timer_count(), 1);
    h.health.stop();
}

#[tokio::test]
async fn test_untimed_after_timed_clears_deadline() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);

    h.states.start_cooldown_timed("t1");
    h.health.schedule_target_check("t1");
    h.states.start_cooldown_untimed("t1");
    h.health.cancel_target_check("t1");

    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Cooling);
    assert!(state.cooldown_ends_at.is_none());
    assert_eq!(h.health.live_timer_count(), 0);

    // A stale timer firing against an untimed target must not revive it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Cooling);
    assert!(state.cooldown_ends_at.is_none());
}

#[tokio::test]
async fn test_on_request_probe_recovers_untimed_target() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);

    h.states.start_cooldown_untimed("t1");

    // First request: no healthy target yet, but the sweep probes t1 in the
    // background (default outcome: success).
    let err = h
        .engine
        .dispatch("gpt-pro", serde_json::json!({"model": "gpt-pro"}), detail_scope())
        .await
        .unwrap_err();
    assert!(matches!(err.inner, ManifoldError::Exhausted { .. }));

    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Healthy);

    // The next request goes through.
    let stream = h
        .engine
        .dispatch("gpt-pro", serde_json::json!({"model": "gpt-pro"}), detail_scope())
        .await
        .unwrap();
    assert_eq!(stream.target_id, "t1");
}

#[tokio::test]
async fn test_on_request_probe_failure_moves_to_timed() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);

    h.states.start_cooldown_untimed("t1");
    h.dispatcher
        .queue(&cred_id("t1"), MockOutcome::Status(500, "still down".into()));

    let _ = h
        .engine
        .dispatch("gpt-pro", serde_json::json!({"model": "gpt-pro"}), detail_scope())
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Cooling);
    assert!(
        state.cooldown_ends_at.is_some(),
        "failed on-request probe re-enters timed cooling"
    );
    assert_eq!(h.health.live_timer_count(), 1);
    h.health.stop();
}

#[tokio::test]
async fn test_probe_history_is_recorded_and_filterable() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1", "t2"])]);

    h.dispatcher
        .queue(&cred_id("t2"), MockOutcome::Status(500, "down".into()));

    h.health.check_target("t1").await.unwrap();
    h.health.check_target("t2").await.unwrap();

    let all = h.health.history(&HealthHistoryFilter::default());
    assert_eq!(all.len(), 2);
    // Newest first.
    assert_eq!(all[0].target_id, "t2");

    let unhealthy = h.health.history(&HealthHistoryFilter {
        status: Some("unhealthy".to_string()),
        ..Default::default()
    });
    assert_eq!(unhealthy.len(), 1);
    assert_eq!(unhealthy[0].target_id, "t2");

    let limited = h.health.history(&HealthHistoryFilter {
        limit: 1,
        ..Default::default()
    });
    assert_eq!(limited.len(), 1);
}
