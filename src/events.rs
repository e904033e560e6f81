//! In-process event bus for classifier state changes.
//!
//! The monitoring loop publishes; telemetry subscribes to turn transitions
//! into immediate alert messages. A lagging subscriber loses old events
//! rather than blocking the publisher.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::classifier::PumpState;

/// Events published by the monitoring loop.
#[derive(Debug, Clone)]
pub enum PumpEvent {
    /// The classifier changed state.
    StateChanged {
        from: &'static str,
        to: PumpState,
        at: DateTime<Utc>,
        /// Current draw of the reading that triggered the change.
        current_amps: Option<f64>,
        /// Seconds since the fault was first observed, when known.
        fault_duration_s: Option<i64>,
        /// Classifier reason for the change, e.g. "Dry×3".
        reason: Option<String>,
    },
}

/// Broadcast wrapper with a fixed buffer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PumpEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PumpEvent) {
        // No receivers is fine (e.g. one-shot CLI modes).
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PumpEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
