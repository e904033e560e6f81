//! Pump-state classifier: debounced fault detection with safety interlocks.
//!
//! A small state machine decides when a power cycle is warranted:
//!
//! ```text
//! Healthy ──fault──▶ Observing ──N consecutive + cooldown──▶ Cycling
//!    ▲                   │                                      │
//!    │                 clean                              success│failure
//!    │                   ▼                                      ▼
//!    └───────────── (back) ◀──expiry── Cooling            Locked (manual
//!                                                          override only)
//! ```
//!
//! Unknown and Off readings are neutral: they neither advance nor reset the
//! fault counter. Dry dominates RapidCycle when both hold in the same tick.
//! An OCR-independent detector counts Normal↔Idle transitions in a sliding
//! window and injects a synthetic RapidCycle observation when the pump is
//! thrashing faster than the display can show.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::AlertingConfig;
use crate::types::PumpStatus;

/// The two fault families that can trigger a power cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Dry,
    RapidCycle,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dry => "Dry",
            Self::RapidCycle => "RapidCycle",
        }
    }

    fn from_status(status: PumpStatus) -> Option<Self> {
        match status {
            PumpStatus::Dry => Some(Self::Dry),
            PumpStatus::RapidCycle => Some(Self::RapidCycle),
            _ => None,
        }
    }

    /// Consecutive observations required before a cycle is authorized.
    fn threshold(self, cfg: &AlertingConfig) -> u32 {
        match self {
            Self::Dry => cfg.dry_consecutive_count,
            Self::RapidCycle => cfg.rapid_cycle_consecutive_count,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier state.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpState {
    Healthy,
    Observing {
        kind: FaultKind,
        first_seen: DateTime<Utc>,
        consecutive: u32,
    },
    /// A cycle has been requested from the relay driver.
    Cycling,
    /// Post-cycle interlock: fault observations are ignored until `until`.
    Cooling { until: DateTime<Utc> },
    /// Requires a manual override to clear.
    Locked { reason: String },
}

impl PumpState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Observing { .. } => "Observing",
            Self::Cycling => "Cycling",
            Self::Cooling { .. } => "Cooling",
            Self::Locked { .. } => "Locked",
        }
    }
}

/// What the monitoring loop should do after an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    None,
    /// Command the relay driver to power-cycle the controller.
    RequestCycle { kind: FaultKind, reason: String },
}

/// A state transition, reported for the event bus and alerting.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: &'static str,
    pub to: PumpState,
    pub at: DateTime<Utc>,
}

/// Outcome of feeding one reading to the classifier.
#[derive(Debug, Clone)]
pub struct Observation {
    pub decision: Decision,
    pub change: Option<StateChange>,
    /// True when the sliding-window detector injected RapidCycle this tick.
    pub synthetic_rapid_cycle: bool,
}

pub struct Classifier {
    state: PumpState,
    last_cycle: Option<DateTime<Utc>>,
    /// Timestamps of recent Normal↔Idle transitions.
    run_transitions: VecDeque<DateTime<Utc>>,
    last_run_status: Option<PumpStatus>,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            state: PumpState::Healthy,
            last_cycle: None,
            run_transitions: VecDeque::new(),
            last_run_status: None,
        }
    }

    pub fn state(&self) -> &PumpState {
        &self.state
    }

    pub fn last_cycle(&self) -> Option<DateTime<Utc>> {
        self.last_cycle
    }

    /// Feed one reading into the state machine.
    pub fn observe(
        &mut self,
        status: PumpStatus,
        now: DateTime<Utc>,
        cfg: &AlertingConfig,
    ) -> Observation {
        let synthetic = self.track_run_transitions(status, now, cfg);

        // Dry dominates RapidCycle when both conditions hold in one tick.
        let effective = if synthetic && status != PumpStatus::Dry && !status.is_fault() {
            PumpStatus::RapidCycle
        } else {
            status
        };

        let from = self.state.name();
        let decision = self.step(effective, now, cfg);
        // Counter bumps within Observing are not transitions.
        let change = if self.state.name() == from {
            None
        } else {
            Some(StateChange {
                from,
                to: self.state.clone(),
                at: now,
            })
        };

        if let Some(ref c) = change {
            info!(
                component = "classifier",
                from = c.from,
                to = c.to.name(),
                "pump state transition"
            );
        }

        Observation {
            decision,
            change,
            synthetic_rapid_cycle: synthetic,
        }
    }

    /// Core transition function. Returns the decision for this tick.
    fn step(&mut self, status: PumpStatus, now: DateTime<Utc>, cfg: &AlertingConfig) -> Decision {
        match self.state.clone() {
            PumpState::Locked { .. } | PumpState::Cycling => Decision::None,

            PumpState::Cooling { until } => {
                if now < until {
                    return Decision::None;
                }
                self.state = PumpState::Healthy;
                // Process the observation that arrived with the expiry.
                self.step(status, now, cfg)
            }

            PumpState::Healthy => match FaultKind::from_status(status) {
                Some(kind) => {
                    self.state = PumpState::Observing {
                        kind,
                        first_seen: now,
                        consecutive: 1,
                    };
                    self.maybe_cycle(now, cfg)
                }
                None => Decision::None,
            },

            PumpState::Observing {
                kind,
                first_seen,
                consecutive,
            } => match FaultKind::from_status(status) {
                Some(new_kind) if new_kind == kind => {
                    self.state = PumpState::Observing {
                        kind,
                        first_seen,
                        consecutive: consecutive + 1,
                    };
                    self.maybe_cycle(now, cfg)
                }
                Some(new_kind) => {
                    // A different fault restarts observation.
                    self.state = PumpState::Observing {
                        kind: new_kind,
                        first_seen: now,
                        consecutive: 1,
                    };
                    self.maybe_cycle(now, cfg)
                }
                None if status.is_clean() => {
                    self.state = PumpState::Healthy;
                    Decision::None
                }
                // Unknown/Off: neutral, counter untouched.
                None => Decision::None,
            },
        }
    }

    /// Move Observing → Cycling when the count is reached and the cooldown
    /// has elapsed.
    fn maybe_cycle(&mut self, now: DateTime<Utc>, cfg: &AlertingConfig) -> Decision {
        let PumpState::Observing {
            kind, consecutive, ..
        } = self.state
        else {
            return Decision::None;
        };

        if consecutive < kind.threshold(cfg) {
            return Decision::None;
        }

        let protection = Duration::seconds(cfg.cycle_protection_minutes as i64 * 60);
        if let Some(last) = self.last_cycle {
            if last + protection > now {
                warn!(
                    component = "classifier",
                    kind = kind.as_str(),
                    consecutive,
                    "fault confirmed but cycle protection active"
                );
                return Decision::None;
            }
        }

        let reason = format!("{kind}×{consecutive}");
        self.state = PumpState::Cycling;
        Decision::RequestCycle { kind, reason }
    }

    /// Report the relay driver's result for a commanded cycle.
    pub fn on_cycle_result(
        &mut self,
        success: bool,
        now: DateTime<Utc>,
        cfg: &AlertingConfig,
    ) -> StateChange {
        let from = self.state.name();
        if success {
            self.last_cycle = Some(now);
            self.run_transitions.clear();
            let until = now + Duration::seconds(cfg.cycle_protection_minutes as i64 * 60);
            self.state = PumpState::Cooling { until };
        } else {
            self.state = PumpState::Locked {
                reason: "relay_failed".to_string(),
            };
        }
        StateChange {
            from,
            to: self.state.clone(),
            at: now,
        }
    }

    /// The relay driver refused the cycle (its own interlock fired, e.g.
    /// after a manual override this state machine did not see). Wait out
    /// the remaining protection instead of re-requesting every tick.
    pub fn on_cycle_refused(&mut self, now: DateTime<Utc>, remaining_s: u64) -> StateChange {
        let from = self.state.name();
        self.state = PumpState::Cooling {
            until: now + Duration::seconds(remaining_s as i64),
        };
        StateChange {
            from,
            to: self.state.clone(),
            at: now,
        }
    }

    /// Record a successful manual cycle so the interlock still applies.
    pub fn note_manual_cycle(&mut self, now: DateTime<Utc>, cfg: &AlertingConfig) {
        self.last_cycle = Some(now);
        self.run_transitions.clear();
        let until = now + Duration::seconds(cfg.cycle_protection_minutes as i64 * 60);
        self.state = PumpState::Cooling { until };
    }

    /// Clear a Locked state via manual override.
    pub fn clear_lock(&mut self, now: DateTime<Utc>) -> Option<StateChange> {
        if !matches!(self.state, PumpState::Locked { .. }) {
            return None;
        }
        let from = self.state.name();
        self.state = PumpState::Healthy;
        Some(StateChange {
            from,
            to: self.state.clone(),
            at: now,
        })
    }

    /// Sliding-window Normal↔Idle transition counter. Returns true when the
    /// window holds more transitions than the configured threshold.
    fn track_run_transitions(
        &mut self,
        status: PumpStatus,
        now: DateTime<Utc>,
        cfg: &AlertingConfig,
    ) -> bool {
        if status.is_clean() {
            if let Some(prev) = self.last_run_status {
                if prev != status {
                    self.run_transitions.push_back(now);
                }
            }
            self.last_run_status = Some(status);
        }

        let window = Duration::seconds(cfg.rapid_cycle_time_window_minutes as i64 * 60);
        while let Some(&front) = self.run_transitions.front() {
            if front + window < now {
                self.run_transitions.pop_front();
            } else {
                break;
            }
        }

        self.run_transitions.len() > cfg.rapid_cycle_threshold_count as usize
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> AlertingConfig {
        AlertingConfig::default() // dry×3, rapid×3, window 10 min, protection 5 min
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(seconds)
    }

    #[test]
    fn test_healthy_stays_healthy_on_clean_readings() {
        let mut fsm = Classifier::new();
        for (i, status) in [PumpStatus::Normal, PumpStatus::Idle, PumpStatus::Normal]
            .into_iter()
            .enumerate()
        {
            let obs = fsm.observe(status, at(i as i64 * 30), &cfg());
            assert_eq!(obs.decision, Decision::None);
        }
        assert_eq!(fsm.state().name(), "Healthy");
    }

    #[test]
    fn test_three_dry_readings_cycle_exactly_once() {
        let mut fsm = Classifier::new();
        let mut cycles = 0;
        for i in 0..3 {
            let obs = fsm.observe(PumpStatus::Dry, at(i * 30), &cfg());
            if let Decision::RequestCycle { reason, .. } = obs.decision {
                cycles += 1;
                assert_eq!(reason, "Dry×3");
            }
        }
        assert_eq!(cycles, 1);
        assert_eq!(fsm.state().name(), "Cycling");
    }

    #[test]
    fn test_clean_reading_resets_observation() {
        let mut fsm = Classifier::new();
        fsm.observe(PumpStatus::Dry, at(0), &cfg());
        fsm.observe(PumpStatus::Dry, at(30), &cfg());
        fsm.observe(PumpStatus::Normal, at(60), &cfg());
        assert_eq!(fsm.state().name(), "Healthy");

        // Two more Dry readings are not enough after the reset.
        fsm.observe(PumpStatus::Dry, at(90), &cfg());
        let obs = fsm.observe(PumpStatus::Dry, at(120), &cfg());
        assert_eq!(obs.decision, Decision::None);
    }

    #[test]
    fn test_unknown_does_not_reset_counter() {
        let mut fsm = Classifier::new();
        fsm.observe(PumpStatus::Dry, at(0), &cfg());
        fsm.observe(PumpStatus::Unknown, at(30), &cfg());
        fsm.observe(PumpStatus::Dry, at(60), &cfg());
        let obs = fsm.observe(PumpStatus::Dry, at(90), &cfg());
        assert!(matches!(obs.decision, Decision::RequestCycle { .. }));
    }

    #[test]
    fn test_different_fault_restarts_observation() {
        let mut fsm = Classifier::new();
        fsm.observe(PumpStatus::Dry, at(0), &cfg());
        fsm.observe(PumpStatus::Dry, at(30), &cfg());
        fsm.observe(PumpStatus::RapidCycle, at(60), &cfg());
        match fsm.state() {
            PumpState::Observing {
                kind, consecutive, ..
            } => {
                assert_eq!(*kind, FaultKind::RapidCycle);
                assert_eq!(*consecutive, 1);
            }
            other => panic!("expected Observing, got {other:?}"),
        }
    }

    #[test]
    fn test_no_two_cycles_within_protection() {
        let mut fsm = Classifier::new();

        // First confirmed fault cycles.
        for i in 0..3 {
            fsm.observe(PumpStatus::Dry, at(i * 30), &cfg());
        }
        fsm.on_cycle_result(true, at(90), &cfg());

        // Cooling expires after 5 minutes; faults resume immediately after,
        // but a second cycle is blocked until protection has elapsed from
        // the last cycle... which coincides with cooling expiry here.
        let mut decisions = Vec::new();
        for i in 0..20 {
            let obs = fsm.observe(PumpStatus::Dry, at(120 + i * 30), &cfg());
            if let Decision::RequestCycle { .. } = obs.decision {
                decisions.push(at(120 + i * 30));
                fsm.on_cycle_result(true, at(120 + i * 30), &cfg());
            }
        }

        // Every pair of successful cycles is separated by >= protection.
        let protection = Duration::seconds(300);
        let mut all = vec![at(90)];
        all.extend(decisions);
        for pair in all.windows(2) {
            assert!(
                pair[1] - pair[0] >= protection,
                "cycles at {:?} violate protection",
                pair
            );
        }
    }

    #[test]
    fn test_cooling_ignores_faults_until_expiry() {
        let mut fsm = Classifier::new();
        for i in 0..3 {
            fsm.observe(PumpStatus::Dry, at(i * 30), &cfg());
        }
        fsm.on_cycle_result(true, at(60), &cfg());
        assert_eq!(fsm.state().name(), "Cooling");

        // Faults during cooldown are ignored.
        let obs = fsm.observe(PumpStatus::Dry, at(90), &cfg());
        assert_eq!(obs.decision, Decision::None);
        assert_eq!(fsm.state().name(), "Cooling");

        // After expiry the same observation enters Observing.
        let obs = fsm.observe(PumpStatus::Dry, at(60 + 301), &cfg());
        assert_eq!(obs.decision, Decision::None);
        assert_eq!(fsm.state().name(), "Observing");
    }

    #[test]
    fn test_relay_failure_locks() {
        let mut fsm = Classifier::new();
        for i in 0..3 {
            fsm.observe(PumpStatus::Dry, at(i * 30), &cfg());
        }
        let change = fsm.on_cycle_result(false, at(90), &cfg());
        assert!(matches!(change.to, PumpState::Locked { ref reason } if reason == "relay_failed"));

        // Locked ignores further faults.
        let obs = fsm.observe(PumpStatus::Dry, at(120), &cfg());
        assert_eq!(obs.decision, Decision::None);

        // Manual override clears it.
        let cleared = fsm.clear_lock(at(150)).unwrap();
        assert_eq!(cleared.to.name(), "Healthy");
    }

    #[test]
    fn test_sliding_window_injects_synthetic_rapid_cycle() {
        let mut fsm = Classifier::new();
        let mut synthetic_seen = false;
        let mut cycle_requested = false;

        // Alternate Normal/Idle every 30s: 12 transitions inside 10 minutes.
        for i in 0..14 {
            let status = if i % 2 == 0 {
                PumpStatus::Normal
            } else {
                PumpStatus::Idle
            };
            let obs = fsm.observe(status, at(i * 30), &cfg());
            synthetic_seen |= obs.synthetic_rapid_cycle;
            if let Decision::RequestCycle { kind, .. } = obs.decision {
                assert_eq!(kind, FaultKind::RapidCycle);
                cycle_requested = true;
                break;
            }
        }

        assert!(synthetic_seen, "window detector never fired");
        assert!(cycle_requested, "no cycle was requested");
    }

    #[test]
    fn test_window_evicts_old_transitions() {
        let mut fsm = Classifier::new();
        // Two transitions 20 minutes apart never accumulate.
        fsm.observe(PumpStatus::Normal, at(0), &cfg());
        fsm.observe(PumpStatus::Idle, at(30), &cfg());
        let obs = fsm.observe(PumpStatus::Normal, at(20 * 60), &cfg());
        assert!(!obs.synthetic_rapid_cycle);
        assert_eq!(fsm.state().name(), "Healthy");
    }

    #[test]
    fn test_dry_dominates_synthetic_rapid_cycle() {
        let mut fsm = Classifier::new();
        // Build up a hot transition window.
        for i in 0..12 {
            let status = if i % 2 == 0 {
                PumpStatus::Normal
            } else {
                PumpStatus::Idle
            };
            fsm.observe(status, at(i * 10), &cfg());
        }
        // Clean slate for state (window full but state may be Observing).
        // A Dry reading now must observe Dry, not RapidCycle.
        fsm.observe(PumpStatus::Dry, at(200), &cfg());
        if let PumpState::Observing { kind, .. } = fsm.state() {
            assert_eq!(*kind, FaultKind::Dry);
        }
    }
}
