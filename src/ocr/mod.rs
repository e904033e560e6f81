//! OCR engine: pluggable text extraction with confidence.
//!
//! Two providers behind one enum, dispatched at construction: a local
//! Tesseract subprocess (primary) and a cloud Read endpoint (optional). A
//! retry wrapper re-runs preprocessing with alternate threshold parameters
//! between attempts — stricter first, then looser — which recovers most
//! glare and low-contrast misreads without operator involvement.

mod cloud;
mod stats;
mod tesseract;

pub use cloud::CloudVisionOcr;
pub use stats::{OcrStats, OcrStatsSnapshot};
pub use tesseract::TesseractOcr;

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::defaults::RETRY_THRESHOLD_STEP;
use crate::config::{ConfigSnapshot, OcrProviderChoice, PreprocessConfig};
use crate::error::{Categorized, ErrorKind};
use crate::imaging::{self, Preprocessed};

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("ocr timed out after {0:?}")]
    Timeout(Duration),
    #[error("ocr provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("ocr failed: {0}")]
    Failed(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected provider response: {0}")]
    BadResponse(String),
    #[error("preprocess failed: {0}")]
    Preprocess(#[from] crate::imaging::ImagingError),
}

impl Categorized for OcrError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Http(_) => ErrorKind::Network,
            Self::Preprocess(_) => ErrorKind::Parse,
            _ => ErrorKind::Ocr,
        }
    }
}

/// Text extracted from one image.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    /// Mean word confidence scaled to [0, 1].
    pub confidence: f64,
    pub duration_ms: u64,
    pub provider: &'static str,
}

/// The configured extractor. Variants are chosen once at construction; the
/// monitoring loop rebuilds the engine when the config provider changes.
pub enum OcrEngine {
    Tesseract(TesseractOcr),
    Cloud(CloudVisionOcr),
}

impl OcrEngine {
    /// Build the engine from config. If the cloud provider is selected but
    /// no API key is available, silently falls back to local Tesseract and
    /// reports the substitution (surfaced via telemetry).
    pub fn from_config(snapshot: &ConfigSnapshot, api_key: Option<&str>) -> (Self, bool) {
        match snapshot.ocr.provider {
            OcrProviderChoice::Tesseract => {
                (Self::Tesseract(TesseractOcr::new(snapshot.ocr.tesseract.clone())), false)
            }
            OcrProviderChoice::Cloud => match api_key {
                Some(key) if !snapshot.ocr.cloud_vision.endpoint.is_empty() => (
                    Self::Cloud(CloudVisionOcr::new(
                        snapshot.ocr.cloud_vision.clone(),
                        key.to_string(),
                    )),
                    false,
                ),
                _ => {
                    warn!(
                        component = "ocr",
                        "cloud provider selected without credentials — using tesseract"
                    );
                    (
                        Self::Tesseract(TesseractOcr::new(snapshot.ocr.tesseract.clone())),
                        true,
                    )
                }
            },
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Tesseract(_) => "tesseract",
            Self::Cloud(_) => "cloudVision",
        }
    }

    /// Extract text from a preprocessed image.
    pub async fn extract(&self, image: &[u8], deadline: Duration) -> Result<OcrResult, OcrError> {
        match self {
            Self::Tesseract(provider) => provider.extract(image, deadline).await,
            Self::Cloud(provider) => provider.extract(image, deadline).await,
        }
    }
}

/// Output of the retrying extraction: the OCR result plus the preprocess
/// artifacts of the attempt that produced it.
pub struct OcrAttempt {
    pub result: OcrResult,
    pub preprocessed: Preprocessed,
    /// Which attempt (0-based) produced the accepted result.
    pub attempt: u32,
}

/// Preprocess settings for the n-th attempt: base, then stricter threshold,
/// then looser.
fn attempt_settings(base: &PreprocessConfig, attempt: u32) -> PreprocessConfig {
    let mut cfg = base.clone();
    let adjusted = match attempt {
        0 => return cfg,
        1 => i16::from(base.threshold_value).saturating_add(RETRY_THRESHOLD_STEP),
        _ => i16::from(base.threshold_value).saturating_sub(RETRY_THRESHOLD_STEP),
    };
    cfg.threshold_value = adjusted.clamp(0, 255) as u8;
    cfg
}

/// Run preprocess + OCR with retries and exponential back-off.
///
/// `deadline` bounds each provider call; callers clamp it to whatever tick
/// budget remains. Returns the first attempt meeting `min_confidence`,
/// otherwise the best attempt seen. Errors only if every attempt failed
/// outright.
pub async fn extract_with_retry(
    engine: &OcrEngine,
    raw_jpeg: &[u8],
    snapshot: &ConfigSnapshot,
    deadline: Duration,
) -> Result<OcrAttempt, OcrError> {
    let attempts = snapshot.ocr.max_retry_attempts.max(1);
    let mut best: Option<OcrAttempt> = None;
    let mut last_err: Option<OcrError> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            // 250ms, 500ms, 1s, ...
            let backoff = Duration::from_millis(250 * (1 << (attempt - 1)));
            tokio::time::sleep(backoff).await;
        }

        let settings = attempt_settings(&snapshot.ocr.preprocessing, attempt);
        let preprocessed = match imaging::preprocess(raw_jpeg, &settings, &snapshot.roi) {
            Ok(p) => p,
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        };

        match engine.extract(&preprocessed.bytes, deadline).await {
            Ok(result) => {
                debug!(
                    component = "ocr",
                    attempt,
                    confidence = result.confidence,
                    text = %result.text,
                    "ocr attempt complete"
                );
                let candidate = OcrAttempt {
                    result,
                    preprocessed,
                    attempt,
                };
                if candidate.result.confidence >= snapshot.ocr.min_confidence {
                    return Ok(candidate);
                }
                let better = best
                    .as_ref()
                    .is_none_or(|b| candidate.result.confidence > b.result.confidence);
                if better {
                    best = Some(candidate);
                }
            }
            Err(e) => {
                warn!(
                    component = "ocr",
                    attempt,
                    err_kind = %e.kind(),
                    error = %e,
                    "ocr attempt failed"
                );
                last_err = Some(e);
            }
        }
    }

    match best {
        Some(attempt) => Ok(attempt),
        None => Err(last_err.unwrap_or_else(|| OcrError::Failed("no attempts ran".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;

    #[test]
    fn test_attempt_settings_progression() {
        let base = PreprocessConfig::default(); // threshold 128
        assert_eq!(attempt_settings(&base, 0).threshold_value, 128);
        assert_eq!(attempt_settings(&base, 1).threshold_value, 153); // stricter
        assert_eq!(attempt_settings(&base, 2).threshold_value, 103); // looser
    }

    #[test]
    fn test_attempt_settings_clamped() {
        let mut base = PreprocessConfig::default();
        base.threshold_value = 250;
        assert_eq!(attempt_settings(&base, 1).threshold_value, 255);
        base.threshold_value = 5;
        assert_eq!(attempt_settings(&base, 2).threshold_value, 0);
    }

    #[test]
    fn test_missing_cloud_credentials_fall_back_to_tesseract() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.ocr.provider = crate::config::OcrProviderChoice::Cloud;
        let (engine, substituted) = OcrEngine::from_config(&snapshot, None);
        assert!(substituted);
        assert_eq!(engine.provider_name(), "tesseract");
    }

    #[test]
    fn test_cloud_with_credentials_selected() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.ocr.provider = crate::config::OcrProviderChoice::Cloud;
        snapshot.ocr.cloud_vision.endpoint = "https://vision.example".to_string();
        let (engine, substituted) = OcrEngine::from_config(&snapshot, Some("key"));
        assert!(!substituted);
        assert_eq!(engine.provider_name(), "cloudVision");
    }
}
