//! Relay action records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the relay driver was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayActionKind {
    /// Automatic power cycle commanded by the classifier.
    Cycle,
    /// Operator-initiated cycle via the `PowerCycle` direct method.
    ManualOverride,
    /// A cycle that was requested but refused (cooldown, debounce).
    Abort,
}

impl RelayActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cycle => "Cycle",
            Self::ManualOverride => "ManualOverride",
            Self::Abort => "Abort",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "Cycle" => Self::Cycle,
            "ManualOverride" => Self::ManualOverride,
            _ => Self::Abort,
        }
    }
}

/// Audit record for every relay operation, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAction {
    /// Monotonic row id (0 until persisted).
    pub id: i64,
    pub timestamp_utc: DateTime<Utc>,
    pub action: RelayActionKind,
    /// Why the action was taken, e.g. "Dry×3" or "manual:operator@hub".
    pub reason: String,
    /// How long the relay was held in the non-safe level.
    pub duration_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for k in [
            RelayActionKind::Cycle,
            RelayActionKind::ManualOverride,
            RelayActionKind::Abort,
        ] {
            assert_eq!(RelayActionKind::from_str_lossy(k.as_str()), k);
        }
    }
}
