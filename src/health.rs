//! System health snapshot: cpu, memory, disk, temperature, component status.
//!
//! Readings come straight from the kernel interfaces (`/proc/stat`,
//! `/proc/meminfo`, `statvfs`, the thermal zone). Component status fields
//! are pushed in by the monitoring loop as it succeeds or fails.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::types::hub::SystemHealthData;

#[derive(Debug, Clone, Default)]
struct ComponentFlags {
    camera_status: Option<String>,
    ocr_status: Option<String>,
    last_successful_reading: Option<DateTime<Utc>>,
}

/// Collects health data for `systemHealth` telemetry.
pub struct HealthMonitor {
    started: Instant,
    data_path: PathBuf,
    /// Previous (busy, total) jiffies sample for cpu usage deltas.
    cpu_prev: Mutex<Option<(u64, u64)>>,
    flags: Mutex<ComponentFlags>,
}

impl HealthMonitor {
    pub fn new(data_path: PathBuf) -> Self {
        Self {
            started: Instant::now(),
            data_path,
            cpu_prev: Mutex::new(None),
            flags: Mutex::new(ComponentFlags::default()),
        }
    }

    pub fn mark_camera(&self, status: impl Into<String>) {
        lock(&self.flags).camera_status = Some(status.into());
    }

    pub fn mark_ocr(&self, status: impl Into<String>) {
        lock(&self.flags).ocr_status = Some(status.into());
    }

    pub fn mark_reading(&self, at: DateTime<Utc>) {
        lock(&self.flags).last_successful_reading = Some(at);
    }

    /// Build a `systemHealth` payload from current probes and flags.
    pub fn snapshot(&self) -> SystemHealthData {
        let flags = lock(&self.flags).clone();
        SystemHealthData {
            cpu_usage: self.cpu_usage(),
            memory_usage: memory_usage().unwrap_or(0.0),
            disk_usage: disk_usage(&self.data_path).unwrap_or(0.0),
            temperature: soc_temperature(),
            camera_status: flags.camera_status.unwrap_or_else(|| "unknown".to_string()),
            ocr_status: flags.ocr_status.unwrap_or_else(|| "unknown".to_string()),
            last_successful_reading: flags.last_successful_reading,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    /// CPU usage percent over the interval since the previous snapshot.
    fn cpu_usage(&self) -> f64 {
        let Some((busy, total)) = read_proc_stat() else {
            return 0.0;
        };
        let mut prev = lock(&self.cpu_prev);
        let usage = match *prev {
            Some((prev_busy, prev_total)) if total > prev_total => {
                let busy_delta = busy.saturating_sub(prev_busy) as f64;
                let total_delta = (total - prev_total) as f64;
                (busy_delta / total_delta * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        *prev = Some((busy, total));
        usage
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Aggregate (busy, total) jiffies from the first line of /proc/stat.
fn read_proc_stat() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().next()?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0); // idle + iowait
    Some((total - idle, total))
}

/// Used memory percent from /proc/meminfo.
fn memory_usage() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<f64>().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse::<f64>().ok()),
            _ => {}
        }
    }
    match (total, available) {
        (Some(t), Some(a)) if t > 0.0 => Some(((t - a) / t * 100.0).clamp(0.0, 100.0)),
        _ => None,
    }
}

/// Used disk percent for the filesystem holding `path`.
fn disk_usage(path: &std::path::Path) -> Option<f64> {
    use std::mem::MaybeUninit;

    let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if result != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    if stat.f_blocks == 0 {
        return None;
    }
    let used = stat.f_blocks - stat.f_bfree;
    Some((used as f64 / stat.f_blocks as f64 * 100.0).clamp(0.0, 100.0))
}

/// SoC temperature in °C from the first thermal zone, when present.
fn soc_temperature() -> Option<f64> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    raw.trim().parse::<f64>().ok().map(|millideg| millideg / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_defaults() {
        let monitor = HealthMonitor::new(PathBuf::from("/tmp"));
        let snap = monitor.snapshot();
        assert_eq!(snap.camera_status, "unknown");
        assert_eq!(snap.ocr_status, "unknown");
        assert!(snap.last_successful_reading.is_none());
    }

    #[test]
    fn test_component_flags_round_trip() {
        let monitor = HealthMonitor::new(PathBuf::from("/tmp"));
        let now = Utc::now();
        monitor.mark_camera("ok");
        monitor.mark_ocr("degraded: timeout");
        monitor.mark_reading(now);

        let snap = monitor.snapshot();
        assert_eq!(snap.camera_status, "ok");
        assert_eq!(snap.ocr_status, "degraded: timeout");
        assert_eq!(snap.last_successful_reading, Some(now));
    }

    #[test]
    fn test_disk_usage_is_percent() {
        if let Some(pct) = disk_usage(std::path::Path::new("/")) {
            assert!((0.0..=100.0).contains(&pct));
        }
    }

    #[test]
    fn test_cpu_usage_needs_two_samples() {
        let monitor = HealthMonitor::new(PathBuf::from("/tmp"));
        // First sample has no baseline.
        assert_eq!(monitor.cpu_usage(), 0.0);
        let second = monitor.cpu_usage();
        assert!((0.0..=100.0).contains(&second));
    }
}
