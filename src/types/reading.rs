//! Pump reading types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operational state of the pump as read from the controller display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PumpStatus {
    /// Pump running with normal current draw.
    Normal,
    /// Pump powered but drawing negligible current.
    Idle,
    /// Controller reports a dry well ("Dry" on the display).
    Dry,
    /// Controller reports rapid cycling ("rcyc" on the display).
    RapidCycle,
    /// Display blank — controller unpowered or display off.
    Off,
    /// Display unreadable or text unparseable.
    #[default]
    Unknown,
}

impl PumpStatus {
    /// Stable string form used in the database and hub messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Idle => "Idle",
            Self::Dry => "Dry",
            Self::RapidCycle => "RapidCycle",
            Self::Off => "Off",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse the stable string form back. Unrecognized values become `Unknown`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "Normal" => Self::Normal,
            "Idle" => Self::Idle,
            "Dry" => Self::Dry,
            "RapidCycle" => Self::RapidCycle,
            "Off" => Self::Off,
            _ => Self::Unknown,
        }
    }

    /// A fault status can advance the classifier toward a power cycle.
    pub fn is_fault(self) -> bool {
        matches!(self, Self::Dry | Self::RapidCycle)
    }

    /// A clean status returns the classifier to `Healthy`.
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Normal | Self::Idle)
    }
}

impl std::fmt::Display for PumpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of the pump controller display.
///
/// Immutable once persisted; only the `synced` flag transitions (false → true)
/// through `mark_synced`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Monotonic row id (0 until persisted).
    pub id: i64,
    pub timestamp_utc: DateTime<Utc>,
    /// Current draw in amps; `None` when the display was unreadable.
    pub current_amps: Option<f64>,
    pub status: PumpStatus,
    /// Raw OCR output before parsing.
    pub raw_text: String,
    /// Combined OCR/parse confidence in [0, 1].
    pub confidence: f64,
    /// Path of the saved debug image, when debug saving is enabled.
    pub image_ref: Option<String>,
    /// Wall time of the capture→parse pipeline for this reading.
    pub processing_ms: i64,
    pub synced: bool,
    pub error: Option<String>,
}

impl Reading {
    /// An error reading recorded when a pipeline step failed.
    ///
    /// Satisfies the invariant that every reading carries either a
    /// confidence in range or a non-null error.
    pub fn error_reading(timestamp_utc: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp_utc,
            current_amps: None,
            status: PumpStatus::Unknown,
            raw_text: String::new(),
            confidence: 0.0,
            image_ref: None,
            processing_ms: 0,
            synced: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            PumpStatus::Normal,
            PumpStatus::Idle,
            PumpStatus::Dry,
            PumpStatus::RapidCycle,
            PumpStatus::Off,
            PumpStatus::Unknown,
        ] {
            assert_eq!(PumpStatus::from_str_lossy(s.as_str()), s);
        }
    }

    #[test]
    fn test_fault_classification() {
        assert!(PumpStatus::Dry.is_fault());
        assert!(PumpStatus::RapidCycle.is_fault());
        assert!(!PumpStatus::Off.is_fault());
        assert!(PumpStatus::Normal.is_clean());
        assert!(!PumpStatus::Unknown.is_clean());
    }

    #[test]
    fn test_error_reading_has_error() {
        let r = Reading::error_reading(Utc::now(), "camera: device busy");
        assert_eq!(r.status, PumpStatus::Unknown);
        assert!(r.error.is_some());
        assert!(r.current_amps.is_none());
    }
}
