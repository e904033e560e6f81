//! GPIO relay driver.
//!
//! The relay sits in the pump controller's supply line. The *safe* level
//! (GPIO low, relay de-energized) leaves the pump powered; asserting the
//! line opens the supply. `cycle` holds the non-safe level for a bounded
//! duration and always restores safe, even when the caller goes away.
//!
//! Two interlocks live here, independent of the classifier:
//! - a minimum inter-cycle interval (`TooSoon` without touching the GPIO)
//! - a post-cycle debounce to avoid contact chatter
//!
//! The process shutdown path calls [`RelayDriver::make_safe`] under the
//! shutdown budget so a crash never leaves the pump dark.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::defaults::{RELAY_CYCLE_DURATION_MAX_MS, RELAY_CYCLE_DURATION_MIN_MS};
use crate::config::RelayConfig;
use crate::error::{Categorized, ErrorKind};
use crate::types::{RelayAction, RelayActionKind};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("cycle refused: {remaining_s}s of cycle protection remaining")]
    TooSoon { remaining_s: u64 },
    #[error("gpio error on pin {pin}: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },
}

impl Categorized for RelayError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Hardware
    }
}

/// A single output line. Implementations must be cheap to toggle; the
/// driver holds its lock across the whole cycle.
pub trait RelayLine: Send {
    /// Drive the line: `true` asserts the non-safe level.
    fn set_active(&mut self, active: bool) -> Result<(), RelayError>;
    fn is_active(&self) -> bool;
}

/// Sysfs-backed GPIO line.
pub struct SysfsGpio {
    pin: u32,
    value_path: PathBuf,
    active: bool,
}

impl SysfsGpio {
    /// Export and configure the pin as an output at the safe level.
    pub fn open(pin: u32) -> Result<Self, RelayError> {
        let base = PathBuf::from("/sys/class/gpio");
        let pin_dir = base.join(format!("gpio{pin}"));

        if !pin_dir.exists() {
            // Export can fail with EBUSY if the pin is already exported.
            if let Err(source) = std::fs::write(base.join("export"), pin.to_string()) {
                if !pin_dir.exists() {
                    return Err(RelayError::Gpio { pin, source });
                }
            }
        }

        std::fs::write(pin_dir.join("direction"), "out")
            .map_err(|source| RelayError::Gpio { pin, source })?;

        let mut line = Self {
            pin,
            value_path: pin_dir.join("value"),
            active: false,
        };
        // Default to the safe level at startup.
        line.set_active(false)?;
        info!(component = "relay", pin, "gpio line configured, safe level set");
        Ok(line)
    }
}

impl RelayLine for SysfsGpio {
    fn set_active(&mut self, active: bool) -> Result<(), RelayError> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.value_path)
            .map_err(|source| RelayError::Gpio { pin: self.pin, source })?;
        file.write_all(if active { b"1" } else { b"0" })
            .map_err(|source| RelayError::Gpio { pin: self.pin, source })?;
        self.active = active;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// In-memory line for tests and `--allow-degraded` runs without hardware.
#[derive(Default)]
pub struct MockRelay {
    pub active: bool,
    pub toggles: Vec<bool>,
    /// When set, the next `set_active` fails.
    pub fail_next: bool,
}

impl RelayLine for MockRelay {
    fn set_active(&mut self, active: bool) -> Result<(), RelayError> {
        if self.fail_next {
            self.fail_next = false;
            return Err(RelayError::Gpio {
                pin: 0,
                source: std::io::Error::other("injected failure"),
            });
        }
        self.active = active;
        self.toggles.push(active);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

struct DriverState {
    line: Box<dyn RelayLine>,
    last_cycle: Option<Instant>,
}

/// The single owner of the relay GPIO line.
pub struct RelayDriver {
    state: Mutex<DriverState>,
}

impl RelayDriver {
    pub fn new(line: Box<dyn RelayLine>) -> Self {
        Self {
            state: Mutex::new(DriverState {
                line,
                last_cycle: None,
            }),
        }
    }

    /// Perform one power cycle: assert for `duration_ms` (clamped to
    /// [500, 30000]), restore safe, debounce.
    ///
    /// Returns the audit record on a completed attempt (`success` tells
    /// whether the GPIO cooperated); `Err(TooSoon)` when the inter-cycle
    /// interval has not elapsed — in that case the GPIO is never touched.
    pub async fn cycle(
        &self,
        cfg: &RelayConfig,
        protection: Duration,
        kind: RelayActionKind,
        reason: &str,
    ) -> Result<RelayAction, RelayError> {
        let mut state = self.state.lock().await;

        if let Some(last) = state.last_cycle {
            let elapsed = last.elapsed();
            if elapsed < protection {
                let remaining_s = (protection - elapsed).as_secs().max(1);
                warn!(
                    component = "relay",
                    reason,
                    remaining_s,
                    "cycle refused by driver interlock"
                );
                return Err(RelayError::TooSoon { remaining_s });
            }
        }

        let duration_ms = cfg
            .cycle_duration_ms
            .clamp(RELAY_CYCLE_DURATION_MIN_MS, RELAY_CYCLE_DURATION_MAX_MS);
        let timestamp_utc = Utc::now();

        info!(
            component = "relay",
            kind = kind.as_str(),
            reason,
            duration_ms,
            "power cycle start"
        );

        let mut success = true;
        let mut error = None;

        if let Err(e) = state.line.set_active(true) {
            success = false;
            error = Some(e.to_string());
        } else {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        }

        // Restore the safe level no matter what happened above.
        if state.line.is_active() {
            if let Err(e) = state.line.set_active(false) {
                // The relay may be stuck open — this is the worst case.
                error!(
                    component = "relay",
                    error = %e,
                    "FAILED TO RESTORE SAFE LEVEL"
                );
                success = false;
                error = Some(format!("restore failed: {e}"));
            }
        }

        if success {
            state.last_cycle = Some(Instant::now());
            // Debounce before the lock is released.
            tokio::time::sleep(Duration::from_millis(cfg.debounce_ms)).await;
        }

        info!(
            component = "relay",
            success,
            elapsed_ms = duration_ms,
            "power cycle complete"
        );

        Ok(RelayAction {
            id: 0,
            timestamp_utc,
            action: kind,
            reason: reason.to_string(),
            duration_ms: duration_ms as i64,
            success,
            error,
            synced: false,
        })
    }

    /// Force the safe level. Used by the shutdown path and the panic-adjacent
    /// supervision in `main`; idempotent.
    pub async fn make_safe(&self) {
        let mut state = self.state.lock().await;
        if state.line.is_active() {
            if let Err(e) = state.line.set_active(false) {
                error!(component = "relay", error = %e, "could not restore safe level at shutdown");
            } else {
                info!(component = "relay", "safe level restored at shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> RelayConfig {
        RelayConfig {
            gpio_pin: 0,
            cycle_duration_ms: 500, // clamp floor, keeps tests quick
            debounce_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_asserts_then_restores() {
        let driver = RelayDriver::new(Box::new(MockRelay::default()));
        let action = driver
            .cycle(&fast_cfg(), Duration::from_secs(300), RelayActionKind::Cycle, "Dry×3")
            .await
            .unwrap();

        assert!(action.success);
        assert_eq!(action.duration_ms, 500);
        assert_eq!(action.reason, "Dry×3");

        let state = driver.state.lock().await;
        assert!(!state.line.is_active(), "line must end at safe level");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_cycle_too_soon() {
        let driver = RelayDriver::new(Box::new(MockRelay::default()));
        let protection = Duration::from_secs(300);

        driver
            .cycle(&fast_cfg(), protection, RelayActionKind::Cycle, "first")
            .await
            .unwrap();

        let err = driver
            .cycle(&fast_cfg(), protection, RelayActionKind::Cycle, "second")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TooSoon { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_assert_reports_failure() {
        let mut line = MockRelay::default();
        line.fail_next = true;
        let driver = RelayDriver::new(Box::new(line));

        let action = driver
            .cycle(&fast_cfg(), Duration::from_secs(300), RelayActionKind::Cycle, "x")
            .await
            .unwrap();
        assert!(!action.success);
        assert!(action.error.is_some());

        // A failed cycle does not arm the interlock; a retry is allowed.
        let retry = driver
            .cycle(&fast_cfg(), Duration::from_secs(300), RelayActionKind::Cycle, "retry")
            .await
            .unwrap();
        assert!(retry.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_clamped() {
        let mut cfg = fast_cfg();
        cfg.cycle_duration_ms = 120_000;
        let driver = RelayDriver::new(Box::new(MockRelay::default()));
        let action = driver
            .cycle(&cfg, Duration::ZERO, RelayActionKind::ManualOverride, "manual")
            .await
            .unwrap();
        assert_eq!(action.duration_ms, 30_000);
    }

    #[tokio::test]
    async fn test_make_safe_idempotent() {
        let driver = RelayDriver::new(Box::new(MockRelay::default()));
        driver.make_safe().await;
        driver.make_safe().await;
        let state = driver.state.lock().await;
        assert!(!state.line.is_active());
    }
}
