//! Twin sync: remote desired properties in, reported properties out,
//! direct methods dispatched.
//!
//! Desired properties arrive either flat in the legacy camelCase shape
//! (`cameraGain`) or nested (`Camera.Gain`); on conflict the nested form
//! wins. Unknown keys are logged and skipped — the hub may be newer than
//! this device. After every apply, a reported-properties subset goes back:
//! applied version, per-field rejections, and derived statistics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::CameraCapture;
use crate::classifier::Classifier;
use crate::config::validation::known_keys;
use crate::config::{ApplyOutcome, ConfigPatch, ConfigSource, ConfigStore};
use crate::error::Categorized;
use crate::health::HealthMonitor;
use crate::hub::{Downlink, HubClient, MethodCall, TwinDesired};
use crate::monitor::lock_classifier;
use crate::ocr::OcrStats;
use crate::relay::RelayDriver;
use crate::storage::Db;
use crate::types::RelayActionKind;

/// Reconnect delay after a failed poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Legacy flat desired-property names and their canonical keys.
const LEGACY_FLAT_KEYS: &[(&str, &str)] = &[
    ("cameraGain", "camera.gain"),
    ("cameraShutterUs", "camera.shutter_us"),
    ("cameraWidth", "camera.width"),
    ("cameraHeight", "camera.height"),
    ("cameraExposureMode", "camera.exposure_mode"),
    ("cameraDebugImagePath", "camera.debug_image_path"),
    ("cameraSaveDebugImages", "camera.save_debug_images"),
    ("ocrProvider", "ocr.provider"),
    ("ocrMinimumConfidence", "ocr.min_confidence"),
    ("ocrMaxRetryAttempts", "ocr.max_retry_attempts"),
    ("captureIntervalSeconds", "monitoring.capture_interval_seconds"),
    ("telemetryIntervalSeconds", "monitoring.telemetry_interval_seconds"),
    ("syncIntervalSeconds", "monitoring.sync_interval_seconds"),
    ("dataRetentionDays", "monitoring.retention_days"),
    ("dryCurrentThreshold", "alerting.dry_current_threshold"),
    ("rapidCycleThresholdCount", "alerting.rapid_cycle_threshold_count"),
    ("powerCycleProtectionMinutes", "alerting.cycle_protection_minutes"),
    ("debugImageSaveEnabled", "debug.image_save_enabled"),
    ("debugImageRetentionDays", "debug.retention_days"),
];

/// Segment aliases applied after snake-casing nested paths.
const SEGMENT_ALIASES: &[(&str, &str)] = &[
    ("ocr.minimum_confidence", "ocr.min_confidence"),
    ("ocr.cloud.endpoint", "ocr.cloud_vision.endpoint"),
    ("monitoring.data_retention_days", "monitoring.retention_days"),
    ("alerting.power_cycle_protection_minutes", "alerting.cycle_protection_minutes"),
    ("roi.x", "roi.x_percent"),
    ("roi.y", "roi.y_percent"),
    ("roi.width", "roi.width_percent"),
    ("roi.height", "roi.height_percent"),
];

/// Shared handles the direct-method dispatcher needs.
pub struct DirectMethodContext {
    pub config: Arc<ConfigStore>,
    pub db: Db,
    pub relay: Arc<RelayDriver>,
    pub classifier: Arc<Mutex<Classifier>>,
    pub camera: Arc<CameraCapture>,
    pub health: Arc<HealthMonitor>,
}

pub struct TwinWorker {
    pub config: Arc<ConfigStore>,
    pub hub: HubClient,
    pub ocr_stats: Arc<OcrStats>,
    pub methods: DirectMethodContext,
}

impl TwinWorker {
    pub async fn run(self, cancel: CancellationToken) {
        info!(component = "twin", "twin worker started");

        // Startup: fetch the full desired document and apply it.
        let mut version = match self.hub.fetch_desired().await {
            Ok(desired) => {
                let v = desired.version;
                self.apply_desired(desired).await;
                v
            }
            Err(e) => {
                warn!(
                    component = "twin",
                    err_kind = %e.kind(),
                    error = %e,
                    "initial desired-properties fetch failed, using local config"
                );
                0
            }
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                result = self.hub.poll_downlink(version) => {
                    match result {
                        Ok(Some(Downlink::TwinUpdate(desired))) => {
                            version = desired.version;
                            self.apply_desired(desired).await;
                        }
                        Ok(Some(Downlink::Method(call))) => {
                            self.dispatch_method(call).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(
                                component = "twin",
                                err_kind = %e.kind(),
                                error = %e,
                                "downlink poll failed, reconnecting"
                            );
                            tokio::select! {
                                () = cancel.cancelled() => break,
                                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }

        info!(component = "twin", "twin worker stopped");
    }

    async fn apply_desired(&self, desired: TwinDesired) {
        let patch = flatten_desired(&desired.properties);
        info!(
            component = "twin",
            version = desired.version,
            fields = patch.len(),
            "applying desired properties"
        );
        let outcome = self
            .config
            .apply(&patch, ConfigSource::Twin, Some(desired.version));
        self.report(&outcome).await;
    }

    /// Push the reported-properties subset back to the hub.
    async fn report(&self, outcome: &ApplyOutcome) {
        let stats = self.ocr_stats.snapshot();
        let pump_state = lock_classifier(&self.methods.classifier).state().name();
        let health = self.methods.health.snapshot();

        let reported = serde_json::json!({
            "appliedVersion": outcome.version,
            "applied": outcome.applied.iter().map(|c| c.key.clone()).collect::<Vec<_>>(),
            "rejected": outcome.rejected.iter().map(|r| serde_json::json!({
                "key": r.key,
                "reason": r.reason,
            })).collect::<Vec<_>>(),
            "stats": {
                "ocrSuccessRate": stats.success_rate,
                "averageConfidence": stats.average_confidence,
                "uptimeSeconds": health.uptime_seconds,
            },
            "pumpState": pump_state,
        });

        if let Err(e) = self.hub.report_properties(&reported).await {
            warn!(component = "twin", error = %e, "reported-properties push failed");
        }
    }

    /// Execute a direct method and answer the hub.
    async fn dispatch_method(&self, call: MethodCall) {
        info!(component = "twin", method = %call.name, id = %call.id, "direct method");
        let response = match call.name.as_str() {
            "PowerCycle" => self.method_power_cycle(&call.payload).await,
            "GetStatus" => self.method_get_status().await,
            "SetExposureMode" => self.method_set_exposure_mode(&call.payload),
            "CaptureOnce" => self.method_capture_once().await,
            other => serde_json::json!({
                "success": false,
                "message": format!("unknown method '{other}'"),
            }),
        };

        if let Err(e) = self.hub.respond_method(&call.id, &response).await {
            warn!(component = "twin", error = %e, "method response failed");
        }
    }

    /// `PowerCycle{reason, userId}` → `{success, message, cycleId}`.
    async fn method_power_cycle(&self, payload: &serde_json::Value) -> serde_json::Value {
        let reason = payload
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("operator request");
        let user = payload
            .get("userId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let full_reason = format!("manual:{user}: {reason}");
        let cycle_id = uuid::Uuid::new_v4().to_string();

        let snapshot = self.config.current();
        let protection = Duration::from_secs(snapshot.alerting.cycle_protection_minutes * 60);

        let result = self
            .methods
            .relay
            .cycle(
                &snapshot.relay,
                protection,
                RelayActionKind::ManualOverride,
                &full_reason,
            )
            .await;

        match result {
            Ok(action) => {
                let success = action.success;
                if let Err(e) = self
                    .methods
                    .db
                    .insert_relay_action(&action, Duration::from_secs(5))
                    .await
                {
                    warn!(component = "twin", error = %e, "could not persist manual relay action");
                }
                if success {
                    let mut classifier = lock_classifier(&self.methods.classifier);
                    // Manual override clears a Locked state and arms the
                    // cooldown like any other cycle.
                    let _ = classifier.clear_lock(Utc::now());
                    classifier.note_manual_cycle(Utc::now(), &snapshot.alerting);
                }
                serde_json::json!({
                    "success": success,
                    "message": if success { "power cycle complete".to_string() }
                               else { action.error.unwrap_or_else(|| "cycle failed".to_string()) },
                    "cycleId": cycle_id,
                })
            }
            Err(e) => serde_json::json!({
                "success": false,
                "message": e.to_string(),
                "cycleId": cycle_id,
            }),
        }
    }

    /// `GetStatus{}` → current state, latest reading, health.
    async fn method_get_status(&self) -> serde_json::Value {
        let state = lock_classifier(&self.methods.classifier).state().name();
        let latest = self
            .methods
            .db
            .latest_reading(Duration::from_secs(5))
            .await
            .ok()
            .flatten();
        let health = self.methods.health.snapshot();

        serde_json::json!({
            "success": true,
            "pumpState": state,
            "latestReading": latest.map(|r| serde_json::json!({
                "timestamp": r.timestamp_utc,
                "currentDraw": r.current_amps,
                "status": r.status,
                "confidence": r.confidence,
            })),
            "health": serde_json::to_value(&health).unwrap_or_default(),
        })
    }

    /// `SetExposureMode{mode}` → apply a one-field config patch.
    fn method_set_exposure_mode(&self, payload: &serde_json::Value) -> serde_json::Value {
        let Some(mode) = payload.get("mode").and_then(|v| v.as_str()) else {
            return serde_json::json!({"success": false, "message": "missing 'mode'"});
        };

        let mut patch = ConfigPatch::new();
        patch.insert(
            "camera.exposure_mode".to_string(),
            serde_json::Value::String(mode.to_string()),
        );
        let outcome = self.config.apply(&patch, ConfigSource::Twin, None);

        if let Some(rejected) = outcome.rejected.first() {
            serde_json::json!({"success": false, "message": rejected.reason})
        } else {
            serde_json::json!({"success": true, "message": format!("exposure mode set to {mode}")})
        }
    }

    /// `CaptureOnce{}` → capture a frame and save it as a debug image.
    async fn method_capture_once(&self) -> serde_json::Value {
        let snapshot = self.config.current();
        match self.methods.camera.capture(&snapshot.camera).await {
            Ok(jpeg) => {
                let dir = std::path::PathBuf::from(&snapshot.camera.debug_image_path);
                match crate::camera::save_debug_image(&dir, Utc::now(), &jpeg) {
                    Ok(path) => serde_json::json!({
                        "success": true,
                        "imagePath": path.display().to_string(),
                        "bytes": jpeg.len(),
                    }),
                    Err(e) => serde_json::json!({
                        "success": false,
                        "message": format!("captured but could not save: {e}"),
                    }),
                }
            }
            Err(e) => serde_json::json!({"success": false, "message": e.to_string()}),
        }
    }
}

/// Flatten a desired-properties document into a canonical patch.
///
/// Flat legacy keys are translated first, then nested groups overwrite them
/// (nested wins on conflict). Unknown keys are logged, never fatal.
pub fn flatten_desired(properties: &serde_json::Value) -> ConfigPatch {
    let mut flat = ConfigPatch::new();
    let mut nested = ConfigPatch::new();

    let Some(object) = properties.as_object() else {
        return flat;
    };

    for (key, value) in object {
        if key.starts_with('$') {
            continue; // metadata ($version, $metadata)
        }
        if value.is_object() {
            collect_nested(key, value, &mut nested);
        } else if let Some(canonical) = legacy_flat_key(key) {
            flat.insert(canonical.to_string(), value.clone());
        } else {
            warn!(component = "twin", key = %key, "unknown flat desired property");
        }
    }

    // Nested wins.
    flat.extend(nested);
    flat
}

fn collect_nested(prefix: &str, value: &serde_json::Value, out: &mut ConfigPatch) {
    let Some(object) = value.as_object() else {
        return;
    };
    for (key, child) in object {
        let path = format!("{prefix}.{key}");
        if child.is_object() {
            collect_nested(&path, child, out);
        } else {
            match canonical_nested_key(&path) {
                Some(canonical) => {
                    out.insert(canonical, child.clone());
                }
                None => {
                    warn!(component = "twin", key = %path, "unknown nested desired property");
                }
            }
        }
    }
}

fn legacy_flat_key(key: &str) -> Option<&'static str> {
    LEGACY_FLAT_KEYS
        .iter()
        .find(|(flat, _)| *flat == key)
        .map(|(_, canonical)| *canonical)
}

/// `Camera.Gain` → `camera.gain`, with aliases for renamed fields.
fn canonical_nested_key(path: &str) -> Option<String> {
    let snaked: String = path
        .split('.')
        .map(to_snake_case)
        .collect::<Vec<_>>()
        .join(".");

    let resolved = SEGMENT_ALIASES
        .iter()
        .find(|(alias, _)| *alias == snaked)
        .map_or(snaked, |(_, canonical)| (*canonical).to_string());

    if known_keys().contains(&resolved.as_str()) {
        Some(resolved)
    } else {
        None
    }
}

fn to_snake_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    for (i, c) in segment.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("Gain"), "gain");
        assert_eq!(to_snake_case("ShutterUs"), "shutter_us");
        assert_eq!(to_snake_case("MinConfidence"), "min_confidence");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn test_nested_keys_resolve() {
        assert_eq!(
            canonical_nested_key("Camera.Gain").as_deref(),
            Some("camera.gain")
        );
        assert_eq!(
            canonical_nested_key("Ocr.MinimumConfidence").as_deref(),
            Some("ocr.min_confidence")
        );
        assert_eq!(
            canonical_nested_key("Monitoring.CaptureIntervalSeconds").as_deref(),
            Some("monitoring.capture_interval_seconds")
        );
        assert!(canonical_nested_key("Camera.Bogus").is_none());
    }

    #[test]
    fn test_flatten_flat_legacy_keys() {
        let patch = flatten_desired(&json!({
            "cameraGain": 2.0,
            "ocrMinimumConfidence": 0.8,
            "completelyUnknown": 7,
        }));
        assert_eq!(patch.get("camera.gain"), Some(&json!(2.0)));
        assert_eq!(patch.get("ocr.min_confidence"), Some(&json!(0.8)));
        assert!(!patch.contains_key("completelyUnknown"));
    }

    #[test]
    fn test_nested_wins_over_flat() {
        let patch = flatten_desired(&json!({
            "cameraGain": 2.0,
            "Camera": { "Gain": 4.0 },
        }));
        assert_eq!(patch.get("camera.gain"), Some(&json!(4.0)));
    }

    #[test]
    fn test_metadata_keys_skipped() {
        let patch = flatten_desired(&json!({
            "$version": 12,
            "$metadata": {"Camera": {}},
            "Camera": { "Gain": 1.5 },
        }));
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get("camera.gain"), Some(&json!(1.5)));
    }

    #[test]
    fn test_scenario_gain_applied_confidence_rejected() {
        // Twin changes Camera.Gain 1.0→2.0 and Ocr.MinimumConfidence→1.5;
        // gain applies, confidence is rejected as out of range.
        let store = ConfigStore::new(crate::config::ConfigSnapshot::default());
        let patch = flatten_desired(&json!({
            "Camera": { "Gain": 2.0 },
            "Ocr": { "MinimumConfidence": 1.5 },
        }));
        let outcome = store.apply(&patch, ConfigSource::Twin, Some(42));

        assert_eq!(outcome.version, 42);
        assert!(outcome.applied.iter().any(|c| c.key == "camera.gain"));
        assert!(outcome.rejected.iter().any(|r| r.key == "ocr.min_confidence"));
        assert_eq!(store.current().camera.gain, 2.0);
        assert_eq!(store.current().ocr.min_confidence, 0.7);
    }

    #[test]
    fn test_deep_nested_groups() {
        let patch = flatten_desired(&json!({
            "Ocr": {
                "Tesseract": { "Language": "eng", "EngineMode": 1 },
                "Preprocessing": { "ThresholdValue": 140 },
            }
        }));
        assert_eq!(patch.get("ocr.tesseract.language"), Some(&json!("eng")));
        assert_eq!(patch.get("ocr.tesseract.engine_mode"), Some(&json!(1)));
        assert_eq!(
            patch.get("ocr.preprocessing.threshold_value"),
            Some(&json!(140))
        );
    }
}
