//! Monitoring loop: the capture → OCR → classify → act pipeline.
//!
//! Runs on the configured capture interval. Each tick reads a fresh config
//! snapshot, drives the camera, preprocess, OCR, and parser, persists the
//! reading, feeds the classifier, and — when the classifier authorizes it —
//! commands the relay driver. Ticks never overlap: a tick that overruns its
//! period causes the next one to be dropped and counted, not queued.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::{self, CameraCapture};
use crate::classifier::{Classifier, Decision, PumpState};
use crate::config::defaults::{
    DEBUG_PRUNE_EVERY_N_CAPTURES, STORAGE_DEADLINE_MS,
};
use crate::config::{ConfigSnapshot, ConfigStore};
use crate::error::Categorized;
use crate::events::{EventBus, PumpEvent};
use crate::health::HealthMonitor;
use crate::ocr::{self, OcrEngine, OcrStats};
use crate::parser;
use crate::relay::{RelayDriver, RelayError};
use crate::storage::{Db, ReadingRing};
use crate::types::{Reading, RelayAction, RelayActionKind};

/// Hardware back-off ceiling between failed captures.
const HW_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Everything the monitoring loop needs, wired up in `main`.
pub struct MonitorDeps {
    pub config: Arc<ConfigStore>,
    pub db: Db,
    pub camera: Arc<CameraCapture>,
    pub relay: Arc<RelayDriver>,
    pub classifier: Arc<Mutex<Classifier>>,
    pub events: EventBus,
    pub health: Arc<HealthMonitor>,
    pub ocr_stats: Arc<OcrStats>,
    pub ocr_api_key: Option<String>,
    pub ring: Arc<ReadingRing>,
}

pub struct MonitorWorker {
    deps: MonitorDeps,
    captures: u64,
    hw_backoff: Duration,
    dropped_ticks: u64,
    consecutive_drops: u32,
}

impl MonitorWorker {
    pub fn new(deps: MonitorDeps) -> Self {
        Self {
            deps,
            captures: 0,
            hw_backoff: Duration::ZERO,
            dropped_ticks: 0,
            consecutive_drops: 0,
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(component = "monitor", "monitoring loop started");

        loop {
            let snapshot = self.deps.config.current();
            let period = Duration::from_secs(snapshot.monitoring.capture_interval_seconds);

            // Tick budget: the period minus a 10% guard band.
            let budget = period - period / 10;
            let started = Instant::now();
            self.tick(&snapshot, &cancel, budget).await;
            let elapsed = started.elapsed();

            if cancel.is_cancelled() {
                break;
            }

            let sleep_for = if elapsed >= period {
                // This tick ran past its period: the next tick is dropped,
                // and we realign to the following boundary.
                self.dropped_ticks += 1;
                self.consecutive_drops += 1;
                if self.consecutive_drops >= 2 {
                    warn!(
                        component = "monitor",
                        dropped = self.dropped_ticks,
                        consecutive = self.consecutive_drops,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "ticks overrunning capture interval"
                    );
                }
                let over_ms = elapsed.as_millis() % period.as_millis().max(1);
                period - Duration::from_millis(over_ms as u64)
            } else {
                self.consecutive_drops = 0;
                period - elapsed
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!(
            component = "monitor",
            captures = self.captures,
            dropped_ticks = self.dropped_ticks,
            "monitoring loop stopped"
        );
    }

    /// One capture → OCR → classify → act pass. Steps carry their own
    /// deadlines, further clamped to the remaining tick budget; on
    /// cancellation the current step finishes and the rest are skipped.
    async fn tick(
        &mut self,
        snapshot: &ConfigSnapshot,
        cancel: &CancellationToken,
        budget: Duration,
    ) {
        let tick_started = Instant::now();
        let timestamp = Utc::now();
        let storage_deadline = Duration::from_millis(STORAGE_DEADLINE_MS);

        // --- Capture ---
        let jpeg = match self.deps.camera.capture(&snapshot.camera).await {
            Ok(bytes) => {
                self.deps.health.mark_camera("ok");
                self.hw_backoff = Duration::ZERO;
                self.captures += 1;
                bytes
            }
            Err(e) => {
                self.deps.health.mark_camera(format!("error: {e}"));
                warn!(
                    component = "monitor",
                    op = "capture",
                    err_kind = %e.kind(),
                    error = %e,
                    "capture failed"
                );
                self.persist_reading(Reading::error_reading(timestamp, format!("camera: {e}")))
                    .await;

                // Double the back-off up to the ceiling before retrying.
                self.hw_backoff = if self.hw_backoff.is_zero() {
                    Duration::from_secs(1)
                } else {
                    (self.hw_backoff * 2).min(HW_BACKOFF_MAX)
                };
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(self.hw_backoff) => {}
                }
                return;
            }
        };

        // --- Debug image saving + retention ---
        let image_ref = if snapshot.debug_images_enabled() {
            let dir = std::path::PathBuf::from(&snapshot.camera.debug_image_path);
            if self.captures % DEBUG_PRUNE_EVERY_N_CAPTURES == 0 {
                let retention = snapshot.debug.retention_days;
                if let Err(e) = camera::prune_debug_images(&dir, retention) {
                    warn!(component = "monitor", error = %e, "debug image prune failed");
                }
            }
            match camera::save_debug_image(&dir, timestamp, &jpeg) {
                Ok(path) => Some(path.display().to_string()),
                Err(e) => {
                    warn!(component = "monitor", error = %e, "debug image save failed");
                    None
                }
            }
        } else {
            None
        };

        if cancel.is_cancelled() {
            return;
        }

        // --- Preprocess + OCR (with retry) ---
        let (engine, substituted) =
            OcrEngine::from_config(snapshot, self.deps.ocr_api_key.as_deref());
        if substituted {
            self.deps.ocr_stats.mark_substituted();
        }

        let ocr_deadline = Duration::from_secs(snapshot.ocr.timeout_seconds)
            .min(budget.saturating_sub(tick_started.elapsed()).max(Duration::from_secs(1)));

        let attempt = match ocr::extract_with_retry(&engine, &jpeg, snapshot, ocr_deadline).await {
            Ok(attempt) => {
                self.deps.health.mark_ocr("ok");
                attempt
            }
            Err(e) => {
                self.deps.health.mark_ocr(format!("error: {e}"));
                self.deps.ocr_stats.record(0.0, false, engine.provider_name());
                warn!(
                    component = "monitor",
                    op = "ocr",
                    err_kind = %e.kind(),
                    error = %e,
                    "ocr failed"
                );
                let mut reading = Reading::error_reading(timestamp, format!("ocr: {e}"));
                reading.image_ref = image_ref;
                reading.processing_ms = tick_started.elapsed().as_millis() as i64;
                self.persist_reading(reading).await;
                return;
            }
        };

        // --- Parse ---
        let parsed = parser::parse_reading(
            &attempt.result.text,
            attempt.result.confidence,
            attempt.preprocessed.ink_ratio,
            snapshot,
        );
        self.deps.ocr_stats.record(
            attempt.result.confidence,
            parsed.error.is_none(),
            attempt.result.provider,
        );

        let reading = Reading {
            id: 0,
            timestamp_utc: timestamp,
            current_amps: parsed.current_amps,
            status: parsed.status,
            raw_text: attempt.result.text.clone(),
            confidence: parsed.confidence.clamp(0.0, 1.0),
            image_ref,
            processing_ms: tick_started.elapsed().as_millis() as i64,
            synced: false,
            error: parsed.error.clone(),
        };

        debug!(
            component = "monitor",
            status = %reading.status,
            current = ?reading.current_amps,
            confidence = reading.confidence,
            elapsed_ms = reading.processing_ms,
            "reading"
        );

        // --- Persist ---
        if parsed.error.is_none() {
            self.deps.health.mark_reading(timestamp);
        }
        self.persist_reading(reading).await;

        if cancel.is_cancelled() {
            return;
        }

        // --- Classify ---
        let observation = {
            let mut classifier = lock_classifier(&self.deps.classifier);
            classifier.observe(parsed.status, timestamp, &snapshot.alerting)
        };

        if let Some(change) = observation.change {
            // A transition into Cycling carries the fault reason so the
            // alert names the right condition.
            let reason = match &observation.decision {
                Decision::RequestCycle { reason, .. } => Some(reason.clone()),
                Decision::None => None,
            };
            self.deps.events.publish(PumpEvent::StateChanged {
                from: change.from,
                to: change.to,
                at: change.at,
                current_amps: parsed.current_amps,
                fault_duration_s: fault_duration(&self.deps.classifier, timestamp),
                reason,
            });
        }

        // --- Act ---
        if let Decision::RequestCycle { kind, reason } = observation.decision {
            info!(
                component = "monitor",
                fault = kind.as_str(),
                reason = %reason,
                "classifier requested power cycle"
            );
            self.execute_cycle(snapshot, &reason, parsed.current_amps, storage_deadline)
                .await;
        }
    }

    /// Drive the relay, record the action, and move the classifier on.
    async fn execute_cycle(
        &mut self,
        snapshot: &ConfigSnapshot,
        reason: &str,
        current_amps: Option<f64>,
        storage_deadline: Duration,
    ) {
        let protection =
            Duration::from_secs(snapshot.alerting.cycle_protection_minutes * 60);
        let now = Utc::now();

        let change = match self
            .deps
            .relay
            .cycle(&snapshot.relay, protection, RelayActionKind::Cycle, reason)
            .await
        {
            Ok(action) => {
                let success = action.success;
                if let Err(e) = self.deps.db.insert_relay_action(&action, storage_deadline).await {
                    warn!(component = "monitor", error = %e, "could not persist relay action");
                }
                let mut classifier = lock_classifier(&self.deps.classifier);
                classifier.on_cycle_result(success, now, &snapshot.alerting)
            }
            Err(RelayError::TooSoon { remaining_s }) => {
                let abort = RelayAction {
                    id: 0,
                    timestamp_utc: now,
                    action: RelayActionKind::Abort,
                    reason: format!("{reason} (too_soon, {remaining_s}s remaining)"),
                    duration_ms: 0,
                    success: false,
                    error: Some("too_soon".to_string()),
                    synced: false,
                };
                if let Err(e) = self.deps.db.insert_relay_action(&abort, storage_deadline).await {
                    warn!(component = "monitor", error = %e, "could not persist relay abort");
                }
                let mut classifier = lock_classifier(&self.deps.classifier);
                classifier.on_cycle_refused(now, remaining_s)
            }
            Err(e) => {
                warn!(component = "monitor", error = %e, "relay cycle errored");
                let mut classifier = lock_classifier(&self.deps.classifier);
                classifier.on_cycle_result(false, now, &snapshot.alerting)
            }
        };

        self.deps.events.publish(PumpEvent::StateChanged {
            from: change.from,
            to: change.to,
            at: change.at,
            current_amps,
            fault_duration_s: None,
            reason: Some(reason.to_string()),
        });
    }

    /// Persist a reading, falling back to the in-memory ring on storage
    /// errors and draining the ring once writes succeed again.
    async fn persist_reading(&self, reading: Reading) {
        let deadline = Duration::from_millis(STORAGE_DEADLINE_MS);

        match self.deps.db.insert_reading(&reading, deadline).await {
            Ok(_) => {
                if !self.deps.ring.is_empty() {
                    for buffered in self.deps.ring.drain() {
                        if let Err(e) = self.deps.db.insert_reading(&buffered, deadline).await {
                            warn!(component = "monitor", error = %e, "ring drain write failed");
                            self.deps.ring.push(buffered);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    component = "monitor",
                    op = "insert_reading",
                    err_kind = %e.kind(),
                    error = %e,
                    buffered = self.deps.ring.len() + 1,
                    "storage write failed, buffering reading"
                );
                self.deps.ring.push(reading);
            }
        }
    }
}

/// Seconds since the current fault was first observed, when Observing.
fn fault_duration(
    classifier: &Arc<Mutex<Classifier>>,
    now: chrono::DateTime<Utc>,
) -> Option<i64> {
    let guard = lock_classifier(classifier);
    match guard.state() {
        PumpState::Observing { first_seen, .. } => Some((now - *first_seen).num_seconds()),
        _ => None,
    }
}

pub(crate) fn lock_classifier(
    classifier: &Arc<Mutex<Classifier>>,
) -> std::sync::MutexGuard<'_, Classifier> {
    match classifier.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PumpStatus;

    #[test]
    fn test_hw_backoff_doubles_to_ceiling() {
        let mut backoff = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..8 {
            backoff = if backoff.is_zero() {
                Duration::from_secs(1)
            } else {
                (backoff * 2).min(HW_BACKOFF_MAX)
            };
            seen.push(backoff.as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_unknown_reading_is_neutral_for_classifier() {
        // The pipeline invariant behind scenario "OCR unreadable": an
        // Unknown reading must not advance fault counters.
        let classifier = Arc::new(Mutex::new(Classifier::new()));
        let cfg = crate::config::AlertingConfig::default();
        let now = Utc::now();
        {
            let mut guard = lock_classifier(&classifier);
            guard.observe(PumpStatus::Dry, now, &cfg);
            guard.observe(PumpStatus::Unknown, now, &cfg);
        }
        let guard = lock_classifier(&classifier);
        match guard.state() {
            PumpState::Observing { consecutive, .. } => assert_eq!(*consecutive, 1),
            other => panic!("unexpected state {other:?}"),
        }
    }
}
