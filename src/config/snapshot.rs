//! The immutable configuration snapshot.
//!
//! A [`ConfigSnapshot`] is built once from defaults, overlaid by the local
//! TOML file and twin desired properties, and then only ever replaced as a
//! whole — readers hold an `Arc` and never observe a partial update.

use serde::{Deserialize, Serialize};

use super::defaults;

/// Exposure mode token passed to the capture subprocess via `--exposure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    Auto,
    #[default]
    Normal,
    Sport,
    Night,
    Backlight,
    Spotlight,
    Barcode,
}

impl ExposureMode {
    /// Token understood by the capture utility.
    pub fn as_token(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Normal => "normal",
            Self::Sport => "sport",
            Self::Night => "night",
            Self::Backlight => "backlight",
            Self::Spotlight => "spotlight",
            Self::Barcode => "barcode",
        }
    }

    pub fn from_token(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "normal" => Some(Self::Normal),
            "sport" => Some(Self::Sport),
            "night" => Some(Self::Night),
            "backlight" => Some(Self::Backlight),
            "spotlight" => Some(Self::Spotlight),
            "barcode" => Some(Self::Barcode),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Which OCR backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OcrProviderChoice {
    #[default]
    Tesseract,
    Cloud,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub gain: f64,
    pub shutter_us: u32,
    pub width: u32,
    pub height: u32,
    pub auto_exposure: bool,
    pub auto_white_balance: bool,
    pub exposure_mode: ExposureMode,
    pub ev: f64,
    /// External capture utility invoked per frame.
    pub capture_binary: String,
    pub debug_image_path: String,
    pub save_debug_images: bool,
    pub timeout_seconds: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            gain: defaults::CAMERA_GAIN,
            shutter_us: defaults::CAMERA_SHUTTER_US,
            width: defaults::CAMERA_WIDTH,
            height: defaults::CAMERA_HEIGHT,
            auto_exposure: false,
            auto_white_balance: false,
            exposure_mode: ExposureMode::Normal,
            ev: defaults::CAMERA_EV,
            capture_binary: defaults::CAMERA_CAPTURE_BINARY.to_string(),
            debug_image_path: format!("{}/{}", defaults::DATA_DIR, defaults::DEBUG_IMAGE_DIR),
            save_debug_images: false,
            timeout_seconds: defaults::CAMERA_TIMEOUT_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub grayscale: bool,
    pub contrast_enabled: bool,
    pub contrast_factor: f64,
    pub brightness_enabled: bool,
    pub brightness_offset: f64,
    pub noise_reduction: bool,
    pub sharpen: bool,
    pub scale_enabled: bool,
    pub scale_factor: f64,
    pub threshold_enabled: bool,
    pub threshold_value: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            contrast_enabled: true,
            contrast_factor: defaults::PREPROCESS_CONTRAST_FACTOR,
            brightness_enabled: false,
            brightness_offset: defaults::PREPROCESS_BRIGHTNESS_OFFSET,
            noise_reduction: true,
            sharpen: false,
            scale_enabled: true,
            scale_factor: defaults::PREPROCESS_SCALE_FACTOR,
            threshold_enabled: true,
            threshold_value: defaults::PREPROCESS_THRESHOLD_VALUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractConfig {
    pub language: String,
    /// OCR engine mode, 0–3.
    pub engine_mode: u8,
    /// Page segmentation mode; single-line display reads use 6, 7, 8, or 13.
    pub page_seg_mode: u8,
    pub char_whitelist: String,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            language: defaults::TESSERACT_LANGUAGE.to_string(),
            engine_mode: defaults::TESSERACT_ENGINE_MODE,
            page_seg_mode: defaults::TESSERACT_PAGE_SEG_MODE,
            char_whitelist: defaults::TESSERACT_CHAR_WHITELIST.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudVisionConfig {
    pub endpoint: String,
    pub max_polling_attempts: u32,
    pub polling_interval_ms: u64,
}

impl Default for CloudVisionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            max_polling_attempts: defaults::CLOUD_MAX_POLLING_ATTEMPTS,
            polling_interval_ms: defaults::CLOUD_POLLING_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub provider: OcrProviderChoice,
    pub min_confidence: f64,
    pub max_retry_attempts: u32,
    pub timeout_seconds: u64,
    pub preprocessing: PreprocessConfig,
    pub tesseract: TesseractConfig,
    pub cloud_vision: CloudVisionConfig,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: OcrProviderChoice::Tesseract,
            min_confidence: defaults::OCR_MIN_CONFIDENCE,
            max_retry_attempts: defaults::OCR_MAX_RETRY_ATTEMPTS,
            timeout_seconds: defaults::OCR_TIMEOUT_SECONDS,
            preprocessing: PreprocessConfig::default(),
            tesseract: TesseractConfig::default(),
            cloud_vision: CloudVisionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub capture_interval_seconds: u64,
    pub telemetry_interval_seconds: u64,
    pub sync_interval_seconds: u64,
    pub retention_days: u32,
    pub assumed_voltage: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            capture_interval_seconds: defaults::CAPTURE_INTERVAL_SECONDS,
            telemetry_interval_seconds: defaults::TELEMETRY_INTERVAL_SECONDS,
            sync_interval_seconds: defaults::SYNC_INTERVAL_SECONDS,
            retention_days: defaults::RETENTION_DAYS,
            assumed_voltage: defaults::ASSUMED_VOLTAGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Below this (amps) while the controller shows Dry, the well is dry.
    pub dry_current_threshold: f64,
    /// At or below this the pump is considered idle.
    pub idle_current_threshold: f64,
    /// At or above this the pump is considered running.
    pub minimum_running_current: f64,
    /// Consecutive Dry readings before a power cycle is authorized.
    pub dry_consecutive_count: u32,
    /// Consecutive RapidCycle readings before a power cycle is authorized.
    pub rapid_cycle_consecutive_count: u32,
    /// Normal↔Idle transitions within the window that trigger a synthetic
    /// RapidCycle observation.
    pub rapid_cycle_threshold_count: u32,
    pub rapid_cycle_time_window_minutes: u64,
    /// Minimum time between commanded power cycles.
    pub cycle_protection_minutes: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            dry_current_threshold: defaults::DRY_CURRENT_THRESHOLD,
            idle_current_threshold: defaults::IDLE_CURRENT_THRESHOLD,
            minimum_running_current: defaults::MINIMUM_RUNNING_CURRENT,
            dry_consecutive_count: defaults::DRY_CONSECUTIVE_COUNT,
            rapid_cycle_consecutive_count: defaults::RAPID_CYCLE_CONSECUTIVE_COUNT,
            rapid_cycle_threshold_count: defaults::RAPID_CYCLE_THRESHOLD_COUNT,
            rapid_cycle_time_window_minutes: defaults::RAPID_CYCLE_TIME_WINDOW_MINUTES,
            cycle_protection_minutes: defaults::CYCLE_PROTECTION_MINUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub gpio_pin: u32,
    pub cycle_duration_ms: u64,
    pub debounce_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gpio_pin: defaults::RELAY_GPIO_PIN,
            cycle_duration_ms: defaults::RELAY_CYCLE_DURATION_MS,
            debounce_ms: defaults::RELAY_DEBOUNCE_MS,
        }
    }
}

/// Region of interest over the captured frame, in percent of width/height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub x_percent: f64,
    pub y_percent: f64,
    pub width_percent: f64,
    pub height_percent: f64,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            x_percent: defaults::ROI_X_PERCENT,
            y_percent: defaults::ROI_Y_PERCENT,
            width_percent: defaults::ROI_WIDTH_PERCENT,
            height_percent: defaults::ROI_HEIGHT_PERCENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub image_save_enabled: bool,
    pub retention_days: u32,
    pub verbose: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            image_save_enabled: false,
            retention_days: defaults::DEBUG_IMAGE_RETENTION_DAYS,
            verbose: false,
        }
    }
}

/// Complete configuration, replaced atomically on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigSnapshot {
    /// Monotonic version counter; twin-applied patches carry the twin version.
    #[serde(skip)]
    pub version: u64,
    pub camera: CameraConfig,
    pub ocr: OcrConfig,
    pub monitoring: MonitoringConfig,
    pub alerting: AlertingConfig,
    pub relay: RelayConfig,
    pub roi: RoiConfig,
    pub debug: DebugConfig,
}

impl ConfigSnapshot {
    /// Debug image saving is on when either the camera flag or the debug
    /// group flag is set (the two exist for legacy twin compatibility).
    pub fn debug_images_enabled(&self) -> bool {
        self.camera.save_debug_images || self.debug.image_save_enabled
    }

    /// Render the snapshot as TOML for `--config-dump`.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
