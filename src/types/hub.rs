//! Hub message shapes.
//!
//! Every message sent to the hub is wrapped in the fixed envelope
//! `{deviceId, timestamp, messageType, data}`. The three message types are
//! `pumpReading`, `alert`, and `systemHealth`; their `data` payloads are the
//! structs below, serialized in camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PumpStatus, Reading};

/// Fixed envelope for all device→hub messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEnvelope {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub data: serde_json::Value,
}

/// Discriminator for the `data` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    PumpReading,
    Alert,
    SystemHealth,
}

/// `pumpReading` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpReadingData {
    pub current_draw: Option<f64>,
    pub status: PumpStatus,
    pub confidence: f64,
    pub raw_text: String,
    pub processing_ms: i64,
}

impl From<&Reading> for PumpReadingData {
    fn from(r: &Reading) -> Self {
        Self {
            current_draw: r.current_amps,
            status: r.status,
            confidence: r.confidence,
            raw_text: r.raw_text.clone(),
            processing_ms: r.processing_ms,
        }
    }
}

/// Alert categories surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    DryWell,
    RapidCycling,
    RelayFailure,
    OcrDegraded,
}

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// `alert` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertData {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub description: String,
    pub current_draw: Option<f64>,
    /// How long the condition has persisted, in seconds.
    pub duration: Option<i64>,
    pub action_required: bool,
}

/// `systemHealth` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthData {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    /// SoC temperature in °C, when the thermal zone is readable.
    pub temperature: Option<f64>,
    pub camera_status: String,
    pub ocr_status: String,
    pub last_successful_reading: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}
