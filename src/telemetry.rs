//! Telemetry worker: periodic hub messages plus immediate alerts.
//!
//! Every telemetry interval the worker emits a `pumpReading` built from the
//! latest reading and a `systemHealth` snapshot. Classifier transitions into
//! `Cycling` or `Locked` (delivered on the event bus) become `alert`
//! messages immediately. When the hub is unreachable, messages go into a
//! bounded in-memory queue (drop-oldest); durable delivery of readings is
//! the sync worker's job, this queue only smooths short outages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, PumpState};
use crate::config::defaults::TELEMETRY_QUEUE_CAP;
use crate::config::ConfigStore;
use crate::error::Categorized;
use crate::events::{EventBus, PumpEvent};
use crate::health::HealthMonitor;
use crate::hub::HubClient;
use crate::monitor::lock_classifier;
use crate::ocr::OcrStats;
use crate::storage::Db;
use crate::types::hub::{
    AlertData, AlertSeverity, AlertType, HubEnvelope, MessageType, PumpReadingData,
};

/// OCR success rate below which an `OcrDegraded` alert is raised.
const OCR_DEGRADED_RATE: f64 = 0.5;
/// Minimum attempts before the OCR rate is meaningful.
const OCR_DEGRADED_MIN_ATTEMPTS: u64 = 10;

pub struct TelemetryWorker {
    pub config: Arc<ConfigStore>,
    pub db: Db,
    pub hub: HubClient,
    pub events: EventBus,
    pub health: Arc<HealthMonitor>,
    pub ocr_stats: Arc<OcrStats>,
    pub classifier: Arc<Mutex<Classifier>>,
}

struct QueueState {
    queue: VecDeque<HubEnvelope>,
    dropped: u64,
    ocr_alert_sent: bool,
}

impl TelemetryWorker {
    pub async fn run(self, cancel: CancellationToken) {
        info!(component = "telemetry", "telemetry worker started");
        let mut rx = self.events.subscribe();
        let mut state = QueueState {
            queue: VecDeque::new(),
            dropped: 0,
            ocr_alert_sent: false,
        };

        loop {
            let interval = Duration::from_secs(
                self.config.current().monitoring.telemetry_interval_seconds,
            );

            tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Ok(PumpEvent::StateChanged { to, at: _, current_amps, fault_duration_s, reason, .. }) => {
                            if let Some(alert) = alert_for_transition(&to, current_amps, fault_duration_s, reason) {
                                let envelope = self.envelope(MessageType::Alert, serde_json::to_value(&alert).unwrap_or_default());
                                self.send_or_queue(&mut state, envelope).await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(component = "telemetry", missed, "event bus lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                () = tokio::time::sleep(interval) => {
                    self.periodic(&mut state).await;
                }
            }
        }

        // Best-effort flush on shutdown.
        self.drain(&mut state).await;
        info!(
            component = "telemetry",
            dropped = state.dropped,
            pending = state.queue.len(),
            "telemetry worker stopped"
        );
    }

    /// Periodic emission: backlog first, then pumpReading and systemHealth.
    async fn periodic(&self, state: &mut QueueState) {
        self.drain(state).await;

        match self
            .db
            .latest_reading(Duration::from_secs(5))
            .await
        {
            Ok(Some(reading)) => {
                let data = PumpReadingData::from(&reading);
                let envelope = self.envelope(
                    MessageType::PumpReading,
                    serde_json::to_value(&data).unwrap_or_default(),
                );
                self.send_or_queue(state, envelope).await;
            }
            Ok(None) => debug!(component = "telemetry", "no readings yet"),
            Err(e) => warn!(component = "telemetry", error = %e, "could not load latest reading"),
        }

        let health = self.health.snapshot();
        let envelope = self.envelope(
            MessageType::SystemHealth,
            serde_json::to_value(&health).unwrap_or_default(),
        );
        self.send_or_queue(state, envelope).await;

        // OCR degradation is detected here rather than per-tick so a single
        // bad frame cannot raise an alert.
        let stats = self.ocr_stats.snapshot();
        if stats.attempts >= OCR_DEGRADED_MIN_ATTEMPTS && stats.success_rate < OCR_DEGRADED_RATE {
            if !state.ocr_alert_sent {
                state.ocr_alert_sent = true;
                let alert = AlertData {
                    alert_type: AlertType::OcrDegraded,
                    severity: AlertSeverity::Medium,
                    description: format!(
                        "OCR success rate {:.0}% over {} attempts",
                        stats.success_rate * 100.0,
                        stats.attempts
                    ),
                    current_draw: None,
                    duration: None,
                    action_required: false,
                };
                let envelope = self.envelope(
                    MessageType::Alert,
                    serde_json::to_value(&alert).unwrap_or_default(),
                );
                self.send_or_queue(state, envelope).await;
            }
        } else {
            state.ocr_alert_sent = false;
        }

        // Keep telemetry state observable in the classifier snapshot too.
        let state_name = lock_classifier(&self.classifier).state().name();
        debug!(component = "telemetry", pump_state = state_name, "periodic telemetry sent");
    }

    fn envelope(&self, message_type: MessageType, data: serde_json::Value) -> HubEnvelope {
        HubEnvelope {
            device_id: self.hub.device_id().to_string(),
            timestamp: Utc::now(),
            message_type,
            data,
        }
    }

    async fn send_or_queue(&self, state: &mut QueueState, envelope: HubEnvelope) {
        match self.hub.send_message(&envelope).await {
            Ok(()) => {}
            Err(e) => {
                debug!(
                    component = "telemetry",
                    err_kind = %e.kind(),
                    error = %e,
                    queued = state.queue.len() + 1,
                    "hub unreachable, queueing message"
                );
                if state.queue.len() >= TELEMETRY_QUEUE_CAP {
                    state.queue.pop_front();
                    state.dropped += 1;
                }
                state.queue.push_back(envelope);
            }
        }
    }

    /// Send queued messages until one fails.
    async fn drain(&self, state: &mut QueueState) {
        while let Some(envelope) = state.queue.front() {
            match self.hub.send_message(envelope).await {
                Ok(()) => {
                    state.queue.pop_front();
                }
                Err(_) => break,
            }
        }
    }
}

/// Build the alert payload for a classifier transition, if it warrants one.
fn alert_for_transition(
    to: &PumpState,
    current_amps: Option<f64>,
    fault_duration_s: Option<i64>,
    reason: Option<String>,
) -> Option<AlertData> {
    match to {
        PumpState::Cycling => {
            let reason = reason.unwrap_or_default();
            let alert_type = if reason.starts_with("Dry") {
                AlertType::DryWell
            } else {
                AlertType::RapidCycling
            };
            Some(AlertData {
                alert_type,
                severity: AlertSeverity::High,
                description: format!("power cycle commanded: {reason}"),
                current_draw: current_amps,
                duration: fault_duration_s,
                action_required: false,
            })
        }
        PumpState::Locked { reason } => Some(AlertData {
            alert_type: AlertType::RelayFailure,
            severity: AlertSeverity::Critical,
            description: format!("classifier locked: {reason}"),
            current_draw: current_amps,
            duration: fault_duration_s,
            action_required: true,
        }),
        _ => None,
    }
}
