//! Camera capture via the external capture utility.
//!
//! The component owns the full command surface of the capture binary:
//! `--shutter <µs> --gain <g> --awb off|auto --ev <…> --width W --height H
//! --exposure <mode> --output -`. One subprocess at a time; a tokio mutex
//! keeps concurrent callers (monitor tick vs. `CaptureOnce` direct method)
//! from racing the device.

mod debug_images;

pub use debug_images::{prune_debug_images, save_debug_image};

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CameraConfig;
use crate::error::{Categorized, ErrorKind};

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera device busy")]
    DeviceBusy,
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("no camera device found")]
    NoDevice,
    #[error("capture produced bad output: {0}")]
    BadOutput(String),
    #[error("failed to run capture binary '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

impl Categorized for CameraError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Hardware,
        }
    }
}

/// Handle to the capture subprocess. Cheap to share behind an `Arc`.
pub struct CameraCapture {
    // The capture utility opens the camera exclusively; serialize callers.
    lock: Mutex<()>,
}

impl CameraCapture {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Capture one JPEG frame with the given settings.
    pub async fn capture(&self, cfg: &CameraConfig) -> Result<Vec<u8>, CameraError> {
        let _guard = self.lock.lock().await;
        let deadline = Duration::from_secs(cfg.timeout_seconds);

        let mut command = build_command(cfg);
        debug!(
            component = "camera",
            binary = %cfg.capture_binary,
            shutter_us = cfg.shutter_us,
            gain = cfg.gain,
            exposure = %cfg.exposure_mode,
            "spawning capture"
        );

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| classify_spawn_error(&cfg.capture_binary, source))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let wait = async {
            if let Some(mut out) = child.stdout.take() {
                out.read_to_end(&mut stdout).await.ok();
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr).await.ok();
            }
            child.wait().await
        };

        let status = match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(CameraError::Spawn {
                    binary: cfg.capture_binary.clone(),
                    source,
                })
            }
            Err(_) => {
                child.start_kill().ok();
                return Err(CameraError::Timeout(deadline));
            }
        };

        let stderr_text = String::from_utf8_lossy(&stderr);
        if !status.success() {
            return Err(classify_failure(&stderr_text));
        }

        if stdout.len() < 2 || stdout[..2] != JPEG_SOI {
            warn!(
                component = "camera",
                bytes = stdout.len(),
                "capture exited cleanly but output is not a JPEG"
            );
            return Err(CameraError::BadOutput(format!(
                "{} bytes, missing JPEG marker",
                stdout.len()
            )));
        }

        Ok(stdout)
    }
}

impl Default for CameraCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the capture command line from camera settings.
fn build_command(cfg: &CameraConfig) -> Command {
    let mut command = Command::new(&cfg.capture_binary);
    if !cfg.auto_exposure {
        command
            .arg("--shutter")
            .arg(cfg.shutter_us.to_string())
            .arg("--gain")
            .arg(format!("{:.2}", cfg.gain));
    }
    command
        .arg("--awb")
        .arg(if cfg.auto_white_balance { "auto" } else { "off" })
        .arg("--ev")
        .arg(format!("{:.1}", cfg.ev))
        .arg("--width")
        .arg(cfg.width.to_string())
        .arg("--height")
        .arg(cfg.height.to_string())
        .arg("--exposure")
        .arg(cfg.exposure_mode.as_token())
        .arg("--output")
        .arg("-")
        .kill_on_drop(true);
    command
}

fn classify_spawn_error(binary: &str, source: std::io::Error) -> CameraError {
    if source.kind() == std::io::ErrorKind::NotFound {
        CameraError::NoDevice
    } else {
        CameraError::Spawn {
            binary: binary.to_string(),
            source,
        }
    }
}

/// Map the capture utility's stderr to a failure mode.
fn classify_failure(stderr: &str) -> CameraError {
    let lower = stderr.to_lowercase();
    if lower.contains("busy") || lower.contains("in use") {
        CameraError::DeviceBusy
    } else if lower.contains("no camera") || lower.contains("not found") || lower.contains("no device")
    {
        CameraError::NoDevice
    } else {
        CameraError::BadOutput(stderr.chars().take(200).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExposureMode;

    fn test_config() -> CameraConfig {
        CameraConfig {
            capture_binary: "/bin/echo".to_string(),
            ..CameraConfig::default()
        }
    }

    #[test]
    fn test_command_surface_manual_exposure() {
        let cfg = test_config();
        let command = build_command(&cfg);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let joined = args.join(" ");
        assert!(joined.contains("--shutter 20000"));
        assert!(joined.contains("--gain 1.00"));
        assert!(joined.contains("--awb off"));
        assert!(joined.contains("--exposure normal"));
        assert!(joined.ends_with("--output -"));
    }

    #[test]
    fn test_command_surface_auto_exposure_omits_manual_flags() {
        let mut cfg = test_config();
        cfg.auto_exposure = true;
        cfg.auto_white_balance = true;
        cfg.exposure_mode = ExposureMode::Night;
        let command = build_command(&cfg);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let joined = args.join(" ");
        assert!(!joined.contains("--shutter"));
        assert!(!joined.contains("--gain"));
        assert!(joined.contains("--awb auto"));
        assert!(joined.contains("--exposure night"));
    }

    #[test]
    fn test_classify_failure_modes() {
        assert!(matches!(
            classify_failure("ERROR: device or resource busy"),
            CameraError::DeviceBusy
        ));
        assert!(matches!(
            classify_failure("ERROR: no cameras available, not found"),
            CameraError::NoDevice
        ));
        assert!(matches!(
            classify_failure("something unexpected"),
            CameraError::BadOutput(_)
        ));
    }

    #[tokio::test]
    async fn test_non_jpeg_output_is_bad_output() {
        // `echo` exits zero but prints the flags back — not a JPEG.
        let capture = CameraCapture::new();
        let err = capture.capture(&test_config()).await.unwrap_err();
        assert!(matches!(err, CameraError::BadOutput(_)));
    }
}
