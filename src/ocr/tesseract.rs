//! Local Tesseract provider.
//!
//! Shells out to the `tesseract` binary in TSV mode and derives the result
//! confidence from the mean per-word confidence. The display whitelist keeps
//! the engine from hallucinating letters out of seven-segment artifacts.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{OcrError, OcrResult};
use crate::config::TesseractConfig;

pub struct TesseractOcr {
    cfg: TesseractConfig,
}

impl TesseractOcr {
    pub fn new(cfg: TesseractConfig) -> Self {
        Self { cfg }
    }

    pub async fn extract(&self, image: &[u8], deadline: Duration) -> Result<OcrResult, OcrError> {
        let started = Instant::now();

        let mut child = Command::new("tesseract")
            .arg("stdin")
            .arg("stdout")
            .arg("--oem")
            .arg(self.cfg.engine_mode.to_string())
            .arg("--psm")
            .arg(self.cfg.page_seg_mode.to_string())
            .arg("-l")
            .arg(&self.cfg.language)
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={}", self.cfg.char_whitelist))
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OcrError::ProviderUnavailable("tesseract binary not found".to_string())
                } else {
                    OcrError::Failed(e.to_string())
                }
            })?;

        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(image)
                    .await
                    .map_err(|e| OcrError::Failed(format!("writing image to tesseract: {e}")))?;
                drop(stdin); // close stdin so tesseract starts processing
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| OcrError::Failed(e.to_string()))
        };

        let output = match tokio::time::timeout(deadline, run).await {
            Ok(result) => result?,
            Err(_) => return Err(OcrError::Timeout(deadline)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Failed(format!(
                "tesseract exited {}: {}",
                output.status,
                stderr.chars().take(200).collect::<String>()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let (text, confidence) = parse_tsv(&tsv);

        Ok(OcrResult {
            text,
            confidence,
            duration_ms: started.elapsed().as_millis() as u64,
            provider: "tesseract",
        })
    }
}

/// Parse Tesseract TSV output into (joined text, mean word confidence).
///
/// TSV rows: level page block par line word left top width height conf text.
/// Word rows have level 5 and a non-negative confidence; everything else is
/// layout structure.
fn parse_tsv(tsv: &str) -> (String, f64) {
    let mut words = Vec::new();
    let mut conf_sum = 0.0;

    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        if cols[0] != "5" {
            continue;
        }
        let conf: f64 = match cols[10].parse() {
            Ok(c) => c,
            Err(_) => continue,
        };
        if conf < 0.0 {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }
        conf_sum += conf;
        words.push(word.to_string());
    }

    if words.is_empty() {
        return (String::new(), 0.0);
    }
    let confidence = (conf_sum / words.len() as f64 / 100.0).clamp(0.0, 1.0);
    (words.join(" "), confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_single_word() {
        let tsv = format!("{HEADER}\n5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t92.5\t4.25\n");
        let (text, conf) = parse_tsv(&tsv);
        assert_eq!(text, "4.25");
        assert!((conf - 0.925).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_skips_structure_rows() {
        let tsv = format!(
            "{HEADER}\n1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n4\t1\t1\t1\t1\t0\t0\t0\t100\t20\t-1\t\n5\t1\t1\t1\t1\t1\t0\t0\t40\t20\t88\tDry\n"
        );
        let (text, conf) = parse_tsv(&tsv);
        assert_eq!(text, "Dry");
        assert!((conf - 0.88).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_multiple_words_mean_confidence() {
        let tsv = format!(
            "{HEADER}\n5\t1\t1\t1\t1\t1\t0\t0\t40\t20\t80\t4.2\n5\t1\t1\t1\t1\t2\t50\t0\t40\t20\t60\tAMPS\n"
        );
        let (text, conf) = parse_tsv(&tsv);
        assert_eq!(text, "4.2 AMPS");
        assert!((conf - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_empty_output() {
        let (text, conf) = parse_tsv(HEADER);
        assert!(text.is_empty());
        assert_eq!(conf, 0.0);
    }
}
