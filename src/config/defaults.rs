//! Built-in configuration defaults.
//!
//! These match a stock deployment on a Raspberry Pi with the camera aimed at
//! the pump controller display. Every value can be overridden by the local
//! config file or by twin desired properties.

/// Default path of the local TOML config file.
pub const CONFIG_FILE: &str = "/etc/wellmonitor/config.toml";

/// Default data directory (SQLite database, debug images).
pub const DATA_DIR: &str = "/var/lib/wellmonitor";

/// SQLite database filename under the data directory.
pub const DB_FILE: &str = "wellmonitor.db";

/// Debug image directory under the data directory.
pub const DEBUG_IMAGE_DIR: &str = "debug_images";

// === Camera ===
pub const CAMERA_GAIN: f64 = 1.0;
pub const CAMERA_SHUTTER_US: u32 = 20_000;
pub const CAMERA_WIDTH: u32 = 1920;
pub const CAMERA_HEIGHT: u32 = 1080;
pub const CAMERA_EV: f64 = 0.0;
pub const CAMERA_CAPTURE_BINARY: &str = "libcamera-still";
/// Capture subprocess hard deadline.
pub const CAMERA_TIMEOUT_SECONDS: u64 = 15;
/// Run the debug-image pruner on every N-th capture.
pub const DEBUG_PRUNE_EVERY_N_CAPTURES: u64 = 20;

// === OCR ===
pub const OCR_MIN_CONFIDENCE: f64 = 0.7;
pub const OCR_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const OCR_TIMEOUT_SECONDS: u64 = 30;
pub const TESSERACT_LANGUAGE: &str = "eng";
pub const TESSERACT_ENGINE_MODE: u8 = 3;
pub const TESSERACT_PAGE_SEG_MODE: u8 = 7;
pub const TESSERACT_CHAR_WHITELIST: &str = "0123456789.DryAMPSrcyc ";
pub const CLOUD_MAX_POLLING_ATTEMPTS: u32 = 10;
pub const CLOUD_POLLING_INTERVAL_MS: u64 = 500;
/// Threshold offset applied on OCR retries: +STEP first (stricter), then -STEP.
pub const RETRY_THRESHOLD_STEP: i16 = 25;

// === Preprocessing ===
pub const PREPROCESS_CONTRAST_FACTOR: f64 = 1.5;
pub const PREPROCESS_BRIGHTNESS_OFFSET: f64 = 0.0;
pub const PREPROCESS_SCALE_FACTOR: f64 = 2.0;
pub const PREPROCESS_THRESHOLD_VALUE: u8 = 128;
/// Ink coverage below this fraction means a blank display.
pub const BLANK_INK_RATIO: f64 = 0.05;

// === Monitoring ===
pub const CAPTURE_INTERVAL_SECONDS: u64 = 30;
pub const TELEMETRY_INTERVAL_SECONDS: u64 = 300;
pub const SYNC_INTERVAL_SECONDS: u64 = 60;
pub const RETENTION_DAYS: u32 = 30;
/// Mains voltage assumed for the energy estimate (single fixed supply).
pub const ASSUMED_VOLTAGE: f64 = 240.0;

// === Alerting / classification ===
pub const DRY_CURRENT_THRESHOLD: f64 = 0.5;
pub const IDLE_CURRENT_THRESHOLD: f64 = 0.05;
pub const MINIMUM_RUNNING_CURRENT: f64 = 0.1;
pub const DRY_CONSECUTIVE_COUNT: u32 = 3;
pub const RAPID_CYCLE_CONSECUTIVE_COUNT: u32 = 3;
pub const RAPID_CYCLE_THRESHOLD_COUNT: u32 = 10;
pub const RAPID_CYCLE_TIME_WINDOW_MINUTES: u64 = 10;
pub const CYCLE_PROTECTION_MINUTES: u64 = 5;

// === Relay ===
pub const RELAY_GPIO_PIN: u32 = 17;
pub const RELAY_CYCLE_DURATION_MS: u64 = 5_000;
pub const RELAY_CYCLE_DURATION_MIN_MS: u64 = 500;
pub const RELAY_CYCLE_DURATION_MAX_MS: u64 = 30_000;
pub const RELAY_DEBOUNCE_MS: u64 = 50;

// === ROI (percent of frame) ===
pub const ROI_X_PERCENT: f64 = 30.0;
pub const ROI_Y_PERCENT: f64 = 35.0;
pub const ROI_WIDTH_PERCENT: f64 = 40.0;
pub const ROI_HEIGHT_PERCENT: f64 = 25.0;

// === Debug ===
pub const DEBUG_IMAGE_RETENTION_DAYS: u32 = 7;

// === Telemetry queue ===
/// Bounded in-memory queue for hub messages while offline (drop-oldest).
pub const TELEMETRY_QUEUE_CAP: usize = 10_000;

// === Sync ===
pub const SYNC_BATCH_SIZE: u32 = 100;
pub const SYNC_BACKOFF_MIN_SECONDS: u64 = 1;
pub const SYNC_BACKOFF_MAX_SECONDS: u64 = 60;
/// Upper bound on upload attempts per UTC day.
pub const SYNC_DAILY_ATTEMPT_CEILING: u32 = 5_000;

// === Storage ===
/// Default deadline for persistence calls.
pub const STORAGE_DEADLINE_MS: u64 = 5_000;
/// Capacity of the in-memory fallback ring used while SQLite is down.
pub const READING_RING_CAP: usize = 256;

// === Shutdown ===
pub const SHUTDOWN_BUDGET_SECONDS: u64 = 10;
