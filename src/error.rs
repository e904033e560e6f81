//! Crate-wide error taxonomy and process exit codes.
//!
//! Every subsystem error type maps into one of the [`ErrorKind`] categories
//! so log lines and telemetry counters stay consistent across components.
//! The categories drive the runtime policy in each worker: retry, degrade,
//! or exit (see the per-worker supervision in `main.rs`).

use serde::Serialize;

/// Process exit codes.
pub mod exit {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Configuration error at startup (bad file, invalid value).
    pub const CONFIG: i32 = 1;
    /// Hardware initialization failed (camera or GPIO) without `--allow-degraded`.
    pub const HARDWARE: i32 = 2;
    /// Hub rejected our credentials at startup.
    pub const HUB_AUTH: i32 = 3;
    /// Invariant violation or unrecoverable runtime failure.
    pub const FATAL: i32 = 4;
}

/// Coarse error category, logged as the `err_kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Hardware,
    Ocr,
    Parse,
    Storage,
    Network,
    Auth,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Hardware => "hardware",
            Self::Ocr => "ocr",
            Self::Parse => "parse",
            Self::Storage => "storage",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every subsystem error so workers can dispatch on category
/// without knowing the concrete type.
pub trait Categorized {
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_snake_case() {
        assert_eq!(ErrorKind::Hardware.as_str(), "hardware");
        assert_eq!(ErrorKind::Timeout.as_str(), "timeout");
        assert_eq!(format!("{}", ErrorKind::Ocr), "ocr");
    }

    #[test]
    fn test_exit_codes_match_contract() {
        assert_eq!(exit::OK, 0);
        assert_eq!(exit::CONFIG, 1);
        assert_eq!(exit::HARDWARE, 2);
        assert_eq!(exit::HUB_AUTH, 3);
        assert_eq!(exit::FATAL, 4);
    }
}
