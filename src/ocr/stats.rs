//! Rolling OCR statistics for telemetry and twin reporting.

use std::sync::Mutex;

#[derive(Debug, Default, Clone)]
struct Inner {
    attempts: u64,
    successes: u64,
    confidence_sum: f64,
    provider_substituted: bool,
    last_provider: Option<&'static str>,
}

/// Point-in-time view of the OCR counters.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub average_confidence: f64,
    /// True when the cloud provider was requested but local ran instead.
    pub provider_substituted: bool,
    pub provider: Option<&'static str>,
}

/// Shared OCR counters, updated by the monitoring loop.
#[derive(Default)]
pub struct OcrStats {
    inner: Mutex<Inner>,
}

impl OcrStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one extraction attempt and whether it met the confidence bar.
    pub fn record(&self, confidence: f64, success: bool, provider: &'static str) {
        let mut inner = lock(&self.inner);
        inner.attempts += 1;
        if success {
            inner.successes += 1;
        }
        inner.confidence_sum += confidence;
        inner.last_provider = Some(provider);
    }

    /// Flag that the configured cloud provider was silently replaced.
    pub fn mark_substituted(&self) {
        lock(&self.inner).provider_substituted = true;
    }

    pub fn snapshot(&self) -> OcrStatsSnapshot {
        let inner = lock(&self.inner).clone();
        let success_rate = if inner.attempts == 0 {
            1.0
        } else {
            inner.successes as f64 / inner.attempts as f64
        };
        let average_confidence = if inner.attempts == 0 {
            0.0
        } else {
            inner.confidence_sum / inner.attempts as f64
        };
        OcrStatsSnapshot {
            attempts: inner.attempts,
            successes: inner.successes,
            success_rate,
            average_confidence,
            provider_substituted: inner.provider_substituted,
            provider: inner.last_provider,
        }
    }
}

fn lock(mutex: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let stats = OcrStats::new();
        stats.record(0.9, true, "tesseract");
        stats.record(0.5, false, "tesseract");
        let snap = stats.snapshot();
        assert_eq!(snap.attempts, 2);
        assert_eq!(snap.successes, 1);
        assert!((snap.success_rate - 0.5).abs() < 1e-9);
        assert!((snap.average_confidence - 0.7).abs() < 1e-9);
        assert!(!snap.provider_substituted);
    }

    #[test]
    fn test_substitution_flag_sticks() {
        let stats = OcrStats::new();
        stats.mark_substituted();
        stats.record(0.8, true, "tesseract");
        assert!(stats.snapshot().provider_substituted);
    }

    #[test]
    fn test_empty_stats() {
        let snap = OcrStats::new().snapshot();
        assert_eq!(snap.attempts, 0);
        assert_eq!(snap.success_rate, 1.0);
        assert_eq!(snap.average_confidence, 0.0);
    }
}
