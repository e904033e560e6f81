//! Debug image persistence and retention.
//!
//! When debug saving is enabled, every raw capture is written to the debug
//! directory as `pump_reading_YYYYMMDD_HHMMSS.jpg` (UTC). The pruner removes
//! files older than the retention window; the monitoring loop runs it on
//! every N-th capture so the directory cannot grow without bound.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Write a raw JPEG to the debug directory, creating it if needed.
/// Returns the full path of the written file.
pub fn save_debug_image(
    dir: &Path,
    timestamp: DateTime<Utc>,
    jpeg: &[u8],
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = format!("pump_reading_{}.jpg", timestamp.format("%Y%m%d_%H%M%S"));
    let path = dir.join(name);
    fs::write(&path, jpeg)?;
    debug!(component = "camera", path = %path.display(), bytes = jpeg.len(), "debug image saved");
    Ok(path)
}

/// Remove debug images older than `retention_days`. Returns how many files
/// were removed. Non-image files and unreadable entries are left alone.
pub fn prune_debug_images(dir: &Path, retention_days: u32) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(u64::from(retention_days) * 86_400);
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(component = "camera", path = %path.display(), error = %e, "could not prune debug image");
                }
            }
        }
    }

    if removed > 0 {
        debug!(component = "camera", removed, "pruned old debug images");
    }
    Ok(removed)
}
