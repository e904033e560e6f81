//! Configuration store with atomic hot reload.
//!
//! The store holds one immutable [`ConfigSnapshot`] behind an
//! [`arc_swap::ArcSwap`]. Readers grab the current `Arc` at the top of each
//! tick and never observe a partial update; writers build a full replacement
//! snapshot, swap it in, and notify subscribers through a `watch` channel.
//!
//! ## Loading order
//!
//! 1. Built-in defaults
//! 2. Local TOML file (`/etc/wellmonitor/config.toml` or `--config`)
//! 3. Twin desired properties at startup, then on every twin update

pub mod defaults;
mod snapshot;
pub mod validation;

pub use snapshot::{
    AlertingConfig, CameraConfig, CloudVisionConfig, ConfigSnapshot, DebugConfig, ExposureMode,
    MonitoringConfig, OcrConfig, OcrProviderChoice, PreprocessConfig, RelayConfig, RoiConfig,
    TesseractConfig,
};
pub use validation::{FieldChange, RejectedField};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Categorized, ErrorKind};

/// A flat patch of dotted canonical keys to JSON values.
pub type ConfigPatch = BTreeMap<String, serde_json::Value>;

/// Where a config change came from, for the delta log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    File,
    Env,
    Twin,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::File => "file",
            Self::Env => "env",
            Self::Twin => "twin",
        })
    }
}

/// Result of applying a patch: what went in, what was refused.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Snapshot version after the apply.
    pub version: u64,
    pub applied: Vec<FieldChange>,
    pub rejected: Vec<RejectedField>,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config file parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Categorized for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Thread-safe configuration store.
pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new(initial: ConfigSnapshot) -> Self {
        let initial = Arc::new(initial);
        let (tx, _) = watch::channel(Arc::clone(&initial));
        Self {
            current: ArcSwap::new(initial),
            tx,
        }
    }

    /// The current snapshot. Cheap; safe to call on every tick.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Subscribe to snapshot replacements. The receiver always starts with
    /// the snapshot that was current at subscription time.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }

    /// Validate and apply a patch. Valid fields go in, invalid fields are
    /// rejected individually; the swap is atomic.
    ///
    /// `version` carries the twin document version when the patch came from
    /// the twin; otherwise the internal counter is bumped by one.
    pub fn apply(
        &self,
        patch: &ConfigPatch,
        source: ConfigSource,
        version: Option<u64>,
    ) -> ApplyOutcome {
        let base = self.current();
        let mut next = (*base).clone();
        let mut outcome = ApplyOutcome::default();

        for (key, value) in patch {
            match validation::apply_field(&mut next, key, value) {
                Ok(Some(change)) => outcome.applied.push(change),
                Ok(None) => {}
                Err(reason) => {
                    outcome.rejected.push(RejectedField {
                        key: key.clone(),
                        reason,
                    });
                }
            }
        }

        // The ROI rectangle is validated as a unit: individually-valid
        // percentages can still push the rectangle off the frame.
        if !validation::roi_is_consistent(&next) {
            let roi_changes: Vec<FieldChange> = outcome
                .applied
                .iter()
                .filter(|c| c.key.starts_with("roi."))
                .cloned()
                .collect();
            next.roi = base.roi.clone();
            outcome.applied.retain(|c| !c.key.starts_with("roi."));
            for change in roi_changes {
                outcome.rejected.push(RejectedField {
                    key: change.key,
                    reason: "roi rectangle exceeds frame bounds".to_string(),
                });
            }
        }

        next.version = version.unwrap_or(base.version + 1);
        // A twin document always advances the stored version (so reported
        // properties can acknowledge it); otherwise only real changes do.
        let store_snapshot = !outcome.applied.is_empty() || version.is_some();
        outcome.version = if store_snapshot { next.version } else { base.version };

        for change in &outcome.applied {
            info!(
                component = "config",
                source = %source,
                key = %change.key,
                old = %change.old,
                new = %change.new,
                "config delta"
            );
        }
        if store_snapshot {
            let next = Arc::new(next);
            self.current.store(Arc::clone(&next));
            let _ = self.tx.send(next);
        }

        for rejected in &outcome.rejected {
            warn!(
                component = "config",
                source = %source,
                key = %rejected.key,
                reason = %rejected.reason,
                "config field rejected"
            );
        }

        outcome
    }
}

/// Load a snapshot from a TOML file layered over the defaults.
///
/// Unknown keys warn but never fail; each known field goes through the same
/// per-field validation as a twin patch, so a config file cannot smuggle in
/// out-of-range values either.
pub fn load_file(path: &Path) -> Result<(ConfigSnapshot, ApplyOutcome), ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: toml::Value = raw.parse()?;

    let mut patch = ConfigPatch::new();
    flatten_toml(&value, "", &mut patch);

    let mut snap = ConfigSnapshot::default();
    let mut outcome = ApplyOutcome::default();
    for (key, json) in &patch {
        match validation::apply_field(&mut snap, key, json) {
            Ok(Some(change)) => outcome.applied.push(change),
            Ok(None) => {}
            Err(reason) => {
                warn!(
                    component = "config",
                    key = %key,
                    reason = %reason,
                    "ignoring config file field"
                );
                outcome.rejected.push(RejectedField {
                    key: key.clone(),
                    reason,
                });
            }
        }
    }
    Ok((snap, outcome))
}

/// Flatten a TOML tree into dotted leaf keys with JSON values.
fn flatten_toml(value: &toml::Value, prefix: &str, out: &mut ConfigPatch) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_toml(v, &path, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), toml_to_json(leaf));
        }
    }
}

fn toml_to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::Value::from(*i),
        toml::Value::Float(f) => {
            serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        toml::Value::Boolean(b) => serde_json::Value::Bool(*b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(toml_to_json).collect())
        }
        toml::Value::Table(_) => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(entries: &[(&str, serde_json::Value)]) -> ConfigPatch {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_apply_mixed_patch_partial() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let outcome = store.apply(
            &patch(&[
                ("camera.gain", json!(2.0)),
                ("ocr.min_confidence", json!(1.5)),
            ]),
            ConfigSource::Twin,
            Some(7),
        );

        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].key, "ocr.min_confidence");

        let snap = store.current();
        assert_eq!(snap.camera.gain, 2.0);
        assert_eq!(snap.ocr.min_confidence, 0.7);
        assert_eq!(snap.version, 7);
    }

    #[test]
    fn test_every_patch_field_applied_or_rejected() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let p = patch(&[
            ("camera.gain", json!(4.0)),
            ("camera.shutter_us", json!(8000)),
            ("bogus.key", json!(1)),
            ("monitoring.capture_interval_seconds", json!(2)), // below min
        ]);
        let outcome = store.apply(&p, ConfigSource::Twin, None);
        let accounted: usize = outcome.applied.len() + outcome.rejected.len();
        assert_eq!(accounted, p.len());
    }

    #[test]
    fn test_subscriber_sees_new_snapshot() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let rx = store.subscribe();
        store.apply(
            &patch(&[("camera.gain", json!(3.0))]),
            ConfigSource::Twin,
            None,
        );
        assert_eq!(rx.borrow().camera.gain, 3.0);
    }

    #[test]
    fn test_roi_group_rejected_when_inconsistent() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let outcome = store.apply(
            &patch(&[
                ("roi.x_percent", json!(90.0)),
                ("roi.width_percent", json!(50.0)),
            ]),
            ConfigSource::Twin,
            None,
        );
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.rejected.len(), 2);
        let snap = store.current();
        assert_eq!(snap.roi.x_percent, defaults::ROI_X_PERCENT);
    }

    #[test]
    fn test_load_file_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[camera]
gain = 2.5

[monitoring]
capture_interval_seconds = 60

[nonsense]
key = true
"#,
        )
        .unwrap();

        let (snap, outcome) = load_file(&path).unwrap();
        assert_eq!(snap.camera.gain, 2.5);
        assert_eq!(snap.monitoring.capture_interval_seconds, 60);
        assert_eq!(snap.camera.width, defaults::CAMERA_WIDTH);
        assert!(outcome.rejected.iter().any(|r| r.key == "nonsense.key"));
    }

    #[test]
    fn test_noop_twin_patch_still_advances_version() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let outcome = store.apply(&ConfigPatch::new(), ConfigSource::Twin, Some(12));
        assert_eq!(outcome.version, 12);
        assert_eq!(store.current().version, 12);
    }
}
