//! End-to-end fault scenarios: classifier + relay driver + persistence.
//!
//! These walk the same decision path the monitoring loop takes, with a mock
//! relay line and an in-memory database, and assert the externally visible
//! outcomes: which relay actions were recorded and when.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use wellmonitor::classifier::{Classifier, Decision};
use wellmonitor::config::{AlertingConfig, RelayConfig};
use wellmonitor::relay::{MockRelay, RelayDriver, RelayError};
use wellmonitor::storage::Db;
use wellmonitor::types::{PumpStatus, RelayActionKind};

const DL: Duration = Duration::from_secs(5);

fn t(seconds: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

fn fast_relay_cfg() -> RelayConfig {
    RelayConfig {
        gpio_pin: 17,
        cycle_duration_ms: 500,
        debounce_ms: 0,
    }
}

/// Dry detection: three consecutive Dry readings at T, T+30, T+60 produce
/// exactly one Cycle relay action with reason "Dry×3".
#[tokio::test]
async fn dry_detection_produces_one_cycle() {
    let db = Db::open_in_memory().await.unwrap();
    let driver = RelayDriver::new(Box::new(MockRelay::default()));
    let mut fsm = Classifier::new();
    let cfg = AlertingConfig::default(); // dry×3, protection 5 min

    let mut actions = Vec::new();
    for i in 0..3 {
        let obs = fsm.observe(PumpStatus::Dry, t(i * 30), &cfg);
        if let Decision::RequestCycle { reason, .. } = obs.decision {
            let action = driver
                .cycle(
                    &fast_relay_cfg(),
                    Duration::from_secs(cfg.cycle_protection_minutes * 60),
                    RelayActionKind::Cycle,
                    &reason,
                )
                .await
                .unwrap();
            db.insert_relay_action(&action, DL).await.unwrap();
            fsm.on_cycle_result(action.success, t(i * 30), &cfg);
            actions.push(action);
        }
    }

    assert_eq!(actions.len(), 1, "exactly one cycle expected");
    assert_eq!(actions[0].reason, "Dry×3");
    assert!(actions[0].success);
    assert_eq!(fsm.state().name(), "Cooling");
}

/// FSM safety: no two successful cycles within the protection window, even
/// under a sustained fault stream.
#[tokio::test(start_paused = true)]
async fn no_two_cycles_within_protection() {
    let driver = RelayDriver::new(Box::new(MockRelay::default()));
    let mut fsm = Classifier::new();
    let cfg = AlertingConfig::default();
    let protection = Duration::from_secs(cfg.cycle_protection_minutes * 60);

    let mut cycle_times = Vec::new();
    for i in 0..120 {
        let now = t(i * 30);
        // Keep the driver's monotonic clock in step with the simulated
        // reading timestamps.
        tokio::time::advance(Duration::from_secs(30)).await;
        let obs = fsm.observe(PumpStatus::Dry, now, &cfg);
        if let Decision::RequestCycle { reason, .. } = obs.decision {
            match driver
                .cycle(&fast_relay_cfg(), protection, RelayActionKind::Cycle, &reason)
                .await
            {
                Ok(action) if action.success => {
                    cycle_times.push(now);
                    fsm.on_cycle_result(true, now, &cfg);
                }
                Ok(_) => {
                    fsm.on_cycle_result(false, now, &cfg);
                }
                Err(RelayError::TooSoon { remaining_s }) => {
                    fsm.on_cycle_refused(now, remaining_s);
                }
                Err(_) => {
                    fsm.on_cycle_result(false, now, &cfg);
                }
            }
        }
    }

    assert!(cycle_times.len() >= 2, "stream should produce repeat cycles");
    for pair in cycle_times.windows(2) {
        let gap = (pair[1] - pair[0]).num_seconds();
        assert!(gap >= 300, "cycles {}s apart violate protection", gap);
    }
}

/// Rapid cycling: an alternating Normal/Idle stream crosses the window
/// threshold and triggers a cycle without any fault text on the display.
#[tokio::test]
async fn rapid_cycle_window_triggers_cycle() {
    let db = Db::open_in_memory().await.unwrap();
    let driver = RelayDriver::new(Box::new(MockRelay::default()));
    let mut fsm = Classifier::new();
    let cfg = AlertingConfig {
        rapid_cycle_threshold_count: 10,
        rapid_cycle_time_window_minutes: 10,
        ..AlertingConfig::default()
    };

    let mut cycled = false;
    // Alternate every 30 s: 12+ transitions well inside 10 minutes.
    for i in 0..20 {
        let status = if i % 2 == 0 { PumpStatus::Normal } else { PumpStatus::Idle };
        let now = t(i * 30);
        let obs = fsm.observe(status, now, &cfg);
        if let Decision::RequestCycle { kind, reason } = obs.decision {
            assert_eq!(kind.as_str(), "RapidCycle");
            let action = driver
                .cycle(
                    &fast_relay_cfg(),
                    Duration::from_secs(cfg.cycle_protection_minutes * 60),
                    RelayActionKind::Cycle,
                    &reason,
                )
                .await
                .unwrap();
            db.insert_relay_action(&action, DL).await.unwrap();
            fsm.on_cycle_result(action.success, now, &cfg);
            cycled = true;
            break;
        }
    }

    assert!(cycled, "rapid cycling never triggered a relay cycle");
}

/// A relay failure locks the classifier; only a manual override clears it.
#[tokio::test(start_paused = true)]
async fn relay_failure_locks_until_override() {
    let mut line = MockRelay::default();
    line.fail_next = true;
    let driver = RelayDriver::new(Box::new(line));
    let mut fsm = Classifier::new();
    let cfg = AlertingConfig::default();

    for i in 0..3 {
        let obs = fsm.observe(PumpStatus::Dry, t(i * 30), &cfg);
        if let Decision::RequestCycle { reason, .. } = obs.decision {
            let action = driver
                .cycle(
                    &fast_relay_cfg(),
                    Duration::from_secs(cfg.cycle_protection_minutes * 60),
                    RelayActionKind::Cycle,
                    &reason,
                )
                .await
                .unwrap();
            assert!(!action.success);
            fsm.on_cycle_result(false, t(i * 30), &cfg);
        }
    }

    assert_eq!(fsm.state().name(), "Locked");

    // Faults keep arriving; nothing happens.
    let obs = fsm.observe(PumpStatus::Dry, t(300), &cfg);
    assert_eq!(obs.decision, Decision::None);

    // Manual override clears the lock.
    fsm.clear_lock(t(400)).unwrap();
    assert_eq!(fsm.state().name(), "Healthy");
}
