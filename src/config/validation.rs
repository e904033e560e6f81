//! Per-field patch validation and application.
//!
//! A patch is a map of dotted canonical keys (`camera.gain`) to JSON values.
//! Each field is validated independently — type, range, enum token — so a
//! patch with one bad field still applies its good fields. The full key
//! registry lives in [`known_keys`]; any new snapshot field must be added
//! there and to [`apply_field`].

use serde_json::Value;

use super::snapshot::{ConfigSnapshot, ExposureMode, OcrProviderChoice};

/// One successfully applied field, with old and new values for the delta log.
#[derive(Debug, Clone)]
pub struct FieldChange {
    pub key: String,
    pub old: Value,
    pub new: Value,
}

/// One rejected field with the reason it was refused.
#[derive(Debug, Clone)]
pub struct RejectedField {
    pub key: String,
    pub reason: String,
}

/// All valid dotted keys, used to reject unknown fields with a clear reason.
pub fn known_keys() -> &'static [&'static str] {
    &[
        "camera.gain",
        "camera.shutter_us",
        "camera.width",
        "camera.height",
        "camera.auto_exposure",
        "camera.auto_white_balance",
        "camera.exposure_mode",
        "camera.ev",
        "camera.capture_binary",
        "camera.debug_image_path",
        "camera.save_debug_images",
        "camera.timeout_seconds",
        "ocr.provider",
        "ocr.min_confidence",
        "ocr.max_retry_attempts",
        "ocr.timeout_seconds",
        "ocr.preprocessing.grayscale",
        "ocr.preprocessing.contrast_enabled",
        "ocr.preprocessing.contrast_factor",
        "ocr.preprocessing.brightness_enabled",
        "ocr.preprocessing.brightness_offset",
        "ocr.preprocessing.noise_reduction",
        "ocr.preprocessing.sharpen",
        "ocr.preprocessing.scale_enabled",
        "ocr.preprocessing.scale_factor",
        "ocr.preprocessing.threshold_enabled",
        "ocr.preprocessing.threshold_value",
        "ocr.tesseract.language",
        "ocr.tesseract.engine_mode",
        "ocr.tesseract.page_seg_mode",
        "ocr.tesseract.char_whitelist",
        "ocr.cloud_vision.endpoint",
        "ocr.cloud_vision.max_polling_attempts",
        "ocr.cloud_vision.polling_interval_ms",
        "monitoring.capture_interval_seconds",
        "monitoring.telemetry_interval_seconds",
        "monitoring.sync_interval_seconds",
        "monitoring.retention_days",
        "monitoring.assumed_voltage",
        "alerting.dry_current_threshold",
        "alerting.idle_current_threshold",
        "alerting.minimum_running_current",
        "alerting.dry_consecutive_count",
        "alerting.rapid_cycle_consecutive_count",
        "alerting.rapid_cycle_threshold_count",
        "alerting.rapid_cycle_time_window_minutes",
        "alerting.cycle_protection_minutes",
        "relay.gpio_pin",
        "relay.cycle_duration_ms",
        "relay.debounce_ms",
        "roi.x_percent",
        "roi.y_percent",
        "roi.width_percent",
        "roi.height_percent",
        "debug.image_save_enabled",
        "debug.retention_days",
        "debug.verbose",
    ]
}

// === Typed extraction helpers ===

fn as_f64(v: &Value) -> Result<f64, String> {
    v.as_f64().ok_or_else(|| format!("expected number, got {v}"))
}

fn f64_in(v: &Value, min: f64, max: f64) -> Result<f64, String> {
    let n = as_f64(v)?;
    if n < min || n > max {
        return Err(format!("{n} outside allowed range [{min}, {max}]"));
    }
    Ok(n)
}

fn u64_in(v: &Value, min: u64, max: u64) -> Result<u64, String> {
    let n = v.as_u64().ok_or_else(|| format!("expected integer, got {v}"))?;
    if n < min || n > max {
        return Err(format!("{n} outside allowed range [{min}, {max}]"));
    }
    Ok(n)
}

fn as_bool(v: &Value) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("expected boolean, got {v}"))
}

fn as_str(v: &Value) -> Result<&str, String> {
    v.as_str().ok_or_else(|| format!("expected string, got {v}"))
}

/// Validate one field and write it into the snapshot.
///
/// Returns `Ok(Some(change))` when the value was valid and different,
/// `Ok(None)` when it was valid but identical, `Err(reason)` on rejection.
#[allow(clippy::too_many_lines)]
pub fn apply_field(
    snap: &mut ConfigSnapshot,
    key: &str,
    value: &Value,
) -> Result<Option<FieldChange>, String> {
    // Writes `$field = new` and reports the change if the value differs.
    macro_rules! set {
        ($field:expr, $new:expr) => {{
            let new_val = $new;
            let old_json = serde_json::json!($field.clone());
            let new_json = serde_json::json!(new_val.clone());
            if old_json == new_json {
                Ok(None)
            } else {
                $field = new_val;
                Ok(Some(FieldChange {
                    key: key.to_string(),
                    old: old_json,
                    new: new_json,
                }))
            }
        }};
    }

    match key {
        // === camera ===
        "camera.gain" => set!(snap.camera.gain, f64_in(value, 0.5, 16.0)?),
        "camera.shutter_us" => {
            set!(snap.camera.shutter_us, u64_in(value, 100, 10_000_000)? as u32)
        }
        "camera.width" => set!(snap.camera.width, u64_in(value, 64, 4096)? as u32),
        "camera.height" => set!(snap.camera.height, u64_in(value, 64, 4096)? as u32),
        "camera.auto_exposure" => set!(snap.camera.auto_exposure, as_bool(value)?),
        "camera.auto_white_balance" => set!(snap.camera.auto_white_balance, as_bool(value)?),
        "camera.exposure_mode" => {
            let token = as_str(value)?;
            let mode = ExposureMode::from_token(token)
                .ok_or_else(|| format!("'{token}' is not a valid exposure mode"))?;
            set!(snap.camera.exposure_mode, mode)
        }
        "camera.ev" => set!(snap.camera.ev, f64_in(value, -10.0, 10.0)?),
        "camera.capture_binary" => {
            set!(snap.camera.capture_binary, as_str(value)?.to_string())
        }
        "camera.debug_image_path" => {
            set!(snap.camera.debug_image_path, as_str(value)?.to_string())
        }
        "camera.save_debug_images" => set!(snap.camera.save_debug_images, as_bool(value)?),
        "camera.timeout_seconds" => {
            set!(snap.camera.timeout_seconds, u64_in(value, 1, 120)?)
        }

        // === ocr ===
        "ocr.provider" => {
            let s = as_str(value)?;
            let choice = match s.to_ascii_lowercase().as_str() {
                "tesseract" => OcrProviderChoice::Tesseract,
                "cloud" | "cloudvision" | "azure" => OcrProviderChoice::Cloud,
                other => return Err(format!("'{other}' is not a valid OCR provider")),
            };
            set!(snap.ocr.provider, choice)
        }
        "ocr.min_confidence" => set!(snap.ocr.min_confidence, f64_in(value, 0.0, 1.0)?),
        "ocr.max_retry_attempts" => {
            set!(snap.ocr.max_retry_attempts, u64_in(value, 0, 5)? as u32)
        }
        "ocr.timeout_seconds" => set!(snap.ocr.timeout_seconds, u64_in(value, 1, 300)?),

        // === ocr.preprocessing ===
        "ocr.preprocessing.grayscale" => {
            set!(snap.ocr.preprocessing.grayscale, as_bool(value)?)
        }
        "ocr.preprocessing.contrast_enabled" => {
            set!(snap.ocr.preprocessing.contrast_enabled, as_bool(value)?)
        }
        "ocr.preprocessing.contrast_factor" => {
            set!(snap.ocr.preprocessing.contrast_factor, f64_in(value, 0.1, 10.0)?)
        }
        "ocr.preprocessing.brightness_enabled" => {
            set!(snap.ocr.preprocessing.brightness_enabled, as_bool(value)?)
        }
        "ocr.preprocessing.brightness_offset" => {
            set!(snap.ocr.preprocessing.brightness_offset, f64_in(value, -255.0, 255.0)?)
        }
        "ocr.preprocessing.noise_reduction" => {
            set!(snap.ocr.preprocessing.noise_reduction, as_bool(value)?)
        }
        "ocr.preprocessing.sharpen" => set!(snap.ocr.preprocessing.sharpen, as_bool(value)?),
        "ocr.preprocessing.scale_enabled" => {
            set!(snap.ocr.preprocessing.scale_enabled, as_bool(value)?)
        }
        "ocr.preprocessing.scale_factor" => {
            set!(snap.ocr.preprocessing.scale_factor, f64_in(value, 0.1, 8.0)?)
        }
        "ocr.preprocessing.threshold_enabled" => {
            set!(snap.ocr.preprocessing.threshold_enabled, as_bool(value)?)
        }
        "ocr.preprocessing.threshold_value" => {
            set!(snap.ocr.preprocessing.threshold_value, u64_in(value, 0, 255)? as u8)
        }

        // === ocr.tesseract ===
        "ocr.tesseract.language" => {
            set!(snap.ocr.tesseract.language, as_str(value)?.to_string())
        }
        "ocr.tesseract.engine_mode" => {
            set!(snap.ocr.tesseract.engine_mode, u64_in(value, 0, 3)? as u8)
        }
        "ocr.tesseract.page_seg_mode" => {
            let n = v_u64(value)?;
            if ![6, 7, 8, 13].contains(&n) {
                return Err(format!("page_seg_mode {n} not in {{6, 7, 8, 13}}"));
            }
            set!(snap.ocr.tesseract.page_seg_mode, n as u8)
        }
        "ocr.tesseract.char_whitelist" => {
            set!(snap.ocr.tesseract.char_whitelist, as_str(value)?.to_string())
        }

        // === ocr.cloud_vision ===
        "ocr.cloud_vision.endpoint" => {
            set!(snap.ocr.cloud_vision.endpoint, as_str(value)?.to_string())
        }
        "ocr.cloud_vision.max_polling_attempts" => {
            set!(snap.ocr.cloud_vision.max_polling_attempts, u64_in(value, 1, 100)? as u32)
        }
        "ocr.cloud_vision.polling_interval_ms" => {
            set!(snap.ocr.cloud_vision.polling_interval_ms, u64_in(value, 50, 60_000)?)
        }

        // === monitoring ===
        "monitoring.capture_interval_seconds" => {
            set!(snap.monitoring.capture_interval_seconds, u64_in(value, 5, 3600)?)
        }
        "monitoring.telemetry_interval_seconds" => {
            set!(snap.monitoring.telemetry_interval_seconds, u64_in(value, 10, 86_400)?)
        }
        "monitoring.sync_interval_seconds" => {
            set!(snap.monitoring.sync_interval_seconds, u64_in(value, 10, 86_400)?)
        }
        "monitoring.retention_days" => {
            set!(snap.monitoring.retention_days, u64_in(value, 1, 365)? as u32)
        }
        "monitoring.assumed_voltage" => {
            set!(snap.monitoring.assumed_voltage, f64_in(value, 100.0, 480.0)?)
        }

        // === alerting ===
        "alerting.dry_current_threshold" => {
            set!(snap.alerting.dry_current_threshold, f64_in(value, 0.0, 50.0)?)
        }
        "alerting.idle_current_threshold" => {
            set!(snap.alerting.idle_current_threshold, f64_in(value, 0.0, 5.0)?)
        }
        "alerting.minimum_running_current" => {
            set!(snap.alerting.minimum_running_current, f64_in(value, 0.0, 50.0)?)
        }
        "alerting.dry_consecutive_count" => {
            set!(snap.alerting.dry_consecutive_count, u64_in(value, 1, 100)? as u32)
        }
        "alerting.rapid_cycle_consecutive_count" => {
            set!(snap.alerting.rapid_cycle_consecutive_count, u64_in(value, 1, 100)? as u32)
        }
        "alerting.rapid_cycle_threshold_count" => {
            set!(snap.alerting.rapid_cycle_threshold_count, u64_in(value, 2, 1000)? as u32)
        }
        "alerting.rapid_cycle_time_window_minutes" => {
            set!(snap.alerting.rapid_cycle_time_window_minutes, u64_in(value, 1, 1440)?)
        }
        "alerting.cycle_protection_minutes" => {
            set!(snap.alerting.cycle_protection_minutes, u64_in(value, 1, 1440)?)
        }

        // === relay ===
        "relay.gpio_pin" => set!(snap.relay.gpio_pin, u64_in(value, 0, 63)? as u32),
        "relay.cycle_duration_ms" => {
            set!(snap.relay.cycle_duration_ms, u64_in(value, 500, 30_000)?)
        }
        "relay.debounce_ms" => set!(snap.relay.debounce_ms, u64_in(value, 0, 5_000)?),

        // === roi ===
        "roi.x_percent" => set!(snap.roi.x_percent, f64_in(value, 0.0, 100.0)?),
        "roi.y_percent" => set!(snap.roi.y_percent, f64_in(value, 0.0, 100.0)?),
        "roi.width_percent" => set!(snap.roi.width_percent, f64_in(value, 1.0, 100.0)?),
        "roi.height_percent" => set!(snap.roi.height_percent, f64_in(value, 1.0, 100.0)?),

        // === debug ===
        "debug.image_save_enabled" => set!(snap.debug.image_save_enabled, as_bool(value)?),
        "debug.retention_days" => {
            set!(snap.debug.retention_days, u64_in(value, 1, 365)? as u32)
        }
        "debug.verbose" => set!(snap.debug.verbose, as_bool(value)?),

        other => Err(format!("unknown config key '{other}'")),
    }
}

fn v_u64(v: &Value) -> Result<u64, String> {
    v.as_u64().ok_or_else(|| format!("expected integer, got {v}"))
}

/// ROI consistency: the rectangle must stay inside the frame.
pub fn roi_is_consistent(snap: &ConfigSnapshot) -> bool {
    snap.roi.x_percent + snap.roi.width_percent <= 100.0
        && snap.roi.y_percent + snap.roi.height_percent <= 100.0
}
