//! WellMonitor: edge agent for water-well pump monitoring.
//!
//! Periodically photographs the pump controller display, extracts the
//! current draw and status text via OCR, classifies the pump state, and —
//! when a fault is confirmed — power-cycles the controller through a GPIO
//! relay. Readings persist locally in SQLite and sync to a cloud hub with
//! store-and-forward semantics.
//!
//! ## Architecture
//!
//! - **Monitoring loop**: capture → preprocess → OCR → parse → classify → act
//! - **Classifier**: debounced pump FSM with cooldown and relay interlocks
//! - **Persistence**: WAL-mode SQLite behind a single-writer façade
//! - **Telemetry / Sync / Twin**: hub messaging, durable upload, remote config

pub mod aggregator;
pub mod camera;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod hub;
pub mod imaging;
pub mod monitor;
pub mod ocr;
pub mod parser;
pub mod relay;
pub mod secrets;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod twin;
pub mod types;

// Re-export the types most callers touch.
pub use classifier::{Classifier, Decision, FaultKind, PumpState};
pub use config::{ConfigSnapshot, ConfigStore};
pub use error::ErrorKind;
pub use storage::Db;
pub use types::{PumpStatus, Reading, RelayAction, RelayActionKind, Summary, SummaryPeriod};
