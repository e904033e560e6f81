//! Cloud Read OCR provider.
//!
//! Submits the image to the configured Read endpoint and polls the returned
//! operation until it succeeds or the polling budget is exhausted. The whole
//! submit+poll sequence runs under the caller's deadline.

use std::time::{Duration, Instant};

use tracing::debug;

use super::{OcrError, OcrResult};
use crate::config::CloudVisionConfig;

pub struct CloudVisionOcr {
    cfg: CloudVisionConfig,
    api_key: String,
    client: reqwest::Client,
}

impl CloudVisionOcr {
    pub fn new(cfg: CloudVisionConfig, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            api_key,
            client,
        }
    }

    pub async fn extract(&self, image: &[u8], deadline: Duration) -> Result<OcrResult, OcrError> {
        let started = Instant::now();
        match tokio::time::timeout(deadline, self.submit_and_poll(image)).await {
            Ok(result) => {
                let (text, confidence) = result?;
                Ok(OcrResult {
                    text,
                    confidence,
                    duration_ms: started.elapsed().as_millis() as u64,
                    provider: "cloudVision",
                })
            }
            Err(_) => Err(OcrError::Timeout(deadline)),
        }
    }

    async fn submit_and_poll(&self, image: &[u8]) -> Result<(String, f64), OcrError> {
        let url = format!(
            "{}/vision/v3.2/read/analyze",
            self.cfg.endpoint.trim_end_matches('/')
        );

        let resp = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(OcrError::BadResponse(format!(
                "submit returned status {}",
                resp.status()
            )));
        }

        let operation_url = resp
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| {
                OcrError::BadResponse("submit response missing Operation-Location".to_string())
            })?;

        for attempt in 0..self.cfg.max_polling_attempts {
            tokio::time::sleep(Duration::from_millis(self.cfg.polling_interval_ms)).await;

            let body: serde_json::Value = self
                .client
                .get(&operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
                .send()
                .await?
                .json()
                .await?;

            match body.get("status").and_then(|s| s.as_str()) {
                Some("succeeded") => return Ok(parse_read_result(&body)),
                Some("failed") => {
                    return Err(OcrError::Failed("cloud read operation failed".to_string()))
                }
                _ => {
                    debug!(component = "ocr", attempt, "cloud read still running");
                }
            }
        }

        Err(OcrError::Failed(format!(
            "cloud read did not finish within {} polls",
            self.cfg.max_polling_attempts
        )))
    }
}

/// Pull line text and mean word confidence out of a completed Read result.
fn parse_read_result(body: &serde_json::Value) -> (String, f64) {
    let mut lines = Vec::new();
    let mut conf_sum = 0.0;
    let mut conf_count = 0u32;

    let read_results = body
        .pointer("/analyzeResult/readResults")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for page in &read_results {
        let Some(page_lines) = page.get("lines").and_then(|v| v.as_array()) else {
            continue;
        };
        for line in page_lines {
            if let Some(text) = line.get("text").and_then(|t| t.as_str()) {
                lines.push(text.to_string());
            }
            let Some(words) = line.get("words").and_then(|v| v.as_array()) else {
                continue;
            };
            for word in words {
                if let Some(conf) = word.get("confidence").and_then(serde_json::Value::as_f64) {
                    conf_sum += conf;
                    conf_count += 1;
                }
            }
        }
    }

    let confidence = if conf_count == 0 {
        0.0
    } else {
        (conf_sum / f64::from(conf_count)).clamp(0.0, 1.0)
    };
    (lines.join(" "), confidence)
}
