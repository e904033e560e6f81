//! Reading parser: OCR text → (current, status, confidence).
//!
//! Rules apply in order, first match wins:
//! 1. blank display (empty text or ink below 5%) → Off
//! 2. OCR confidence below the configured floor → Unknown ("low_confidence")
//! 3. token `Dry` (case-insensitive) → Dry
//! 4. token `rcyc` → RapidCycle
//! 5. numeric token `^\d{1,2}\.\d{1,2}$` → amps, classified by thresholds
//! 6. anything else → Unknown ("unparseable")
//!
//! The blank rule runs before the confidence gate: a dark display produces
//! near-zero OCR confidence, and that is a valid Off observation rather
//! than a failed read.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::defaults::BLANK_INK_RATIO;
use crate::config::ConfigSnapshot;
use crate::types::PumpStatus;

static AMPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Display shows at most two integer and two fractional digits.
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^\d{1,2}\.\d{1,2}$").unwrap()
});

/// Parsed observation, ready to be recorded as a Reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReading {
    pub current_amps: Option<f64>,
    pub status: PumpStatus,
    pub confidence: f64,
    pub error: Option<String>,
}

/// Apply the parsing rules to one OCR result.
pub fn parse_reading(
    text: &str,
    ocr_confidence: f64,
    ink_ratio: f64,
    snapshot: &ConfigSnapshot,
) -> ParsedReading {
    let trimmed = text.trim();

    // Rule: blank display.
    if trimmed.is_empty() || ink_ratio < BLANK_INK_RATIO {
        return ParsedReading {
            current_amps: None,
            status: PumpStatus::Off,
            confidence: 1.0 - ink_ratio,
            error: None,
        };
    }

    // Rule: unusable OCR output.
    if ocr_confidence < snapshot.ocr.min_confidence {
        return ParsedReading {
            current_amps: None,
            status: PumpStatus::Unknown,
            confidence: ocr_confidence,
            error: Some("low_confidence".to_string()),
        };
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();

    // Rule: Dry token.
    if tokens.iter().any(|t| t.eq_ignore_ascii_case("dry")) {
        return ParsedReading {
            current_amps: None,
            status: PumpStatus::Dry,
            confidence: ocr_confidence,
            error: None,
        };
    }

    // Rule: rapid-cycle token.
    if tokens.iter().any(|t| t.eq_ignore_ascii_case("rcyc")) {
        return ParsedReading {
            current_amps: None,
            status: PumpStatus::RapidCycle,
            confidence: ocr_confidence,
            error: None,
        };
    }

    // Rule: numeric current draw.
    if let Some(amps) = tokens
        .iter()
        .find(|t| AMPS_RE.is_match(t))
        .and_then(|t| t.parse::<f64>().ok())
    {
        let status = if amps <= snapshot.alerting.idle_current_threshold {
            PumpStatus::Idle
        } else if amps >= snapshot.alerting.minimum_running_current {
            PumpStatus::Normal
        } else {
            // Between idle and running thresholds: ambiguous.
            PumpStatus::Unknown
        };
        return ParsedReading {
            current_amps: Some(amps),
            status,
            confidence: ocr_confidence,
            error: None,
        };
    }

    ParsedReading {
        current_amps: None,
        status: PumpStatus::Unknown,
        confidence: ocr_confidence,
        error: Some("unparseable".to_string()),
    }
}
