use async_trait::async_trait;
use image::{GrayImage, ImageFormat};
use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Characters the engine may emit: alphanumerics, `:.-/` and space.
pub const CHAR_WHITELIST: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789:.-/ ";

/// Page layout hint passed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationMode {
    /// A single uniform block of text, as on a device printout.
    SingleBlock,
}

impl SegmentationMode {
    /// Tesseract `--psm` value.
    pub fn psm(self) -> u8 {
        match self {
            SegmentationMode::SingleBlock => 6,
        }
    }
}

/// A unit of recognized text and the engine's confidence in it (0-100).
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedToken {
    pub text: String,
    pub confidence: f64,
}

impl RecognizedToken {
    pub fn new(text: &str, confidence: f64) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

/// External optical character recognition engine.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize `image`, returning tokens in reading order.
    async fn recognize(
        &self,
        image: &GrayImage,
        whitelist: &str,
        mode: SegmentationMode,
    ) -> Result<Vec<RecognizedToken>, EngineError>;
}

/// Text retained from one recognition pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    /// Retained tokens joined with single spaces, in recognition order.
    pub raw_text: String,
    pub confidences: Vec<f64>,
}

impl Recognition {
    /// Keep tokens whose confidence is strictly above `threshold`.
    pub fn from_tokens(tokens: Vec<RecognizedToken>, threshold: f64) -> Self {
        let (texts, confidences): (Vec<String>, Vec<f64>) = tokens
            .into_iter()
            .filter(|t| t.confidence > threshold)
            .map(|t| (t.text, t.confidence))
            .unzip();

        Self {
            raw_text: texts.join(" "),
            confidences,
        }
    }

    /// Arithmetic mean of retained confidences; 0 when nothing was retained.
    pub fn mean_confidence(&self) -> f64 {
        if self.confidences.is_empty() {
            return 0.0;
        }
        self.confidences.iter().sum::<f64>() / self.confidences.len() as f64
    }
}

/// Run the engine once with the printout settings, bounded by `timeout`.
pub async fn recognize_text(
    engine: &Arc<dyn RecognitionEngine>,
    image: &GrayImage,
    threshold: f64,
    timeout: Duration,
) -> Result<Recognition, EngineError> {
    let tokens = tokio::time::timeout(
        timeout,
        engine.recognize(image, CHAR_WHITELIST, SegmentationMode::SingleBlock),
    )
    .await
    .map_err(|_| EngineError::Timeout(timeout))??;

    let total = tokens.len();
    let recognition = Recognition::from_tokens(tokens, threshold);

    tracing::debug!(
        engine = engine.name(),
        tokens = total,
        retained = recognition.confidences.len(),
        threshold,
        "Recognition pass complete"
    );

    Ok(recognition)
}

/// Tesseract invoked as a subprocess, reading PNG from stdin and writing TSV.
pub struct TesseractCli {
    command: String,
    lang: String,
}

impl TesseractCli {
    pub fn new(command: &str, lang: &str) -> Self {
        Self {
            command: command.to_string(),
            lang: lang.to_string(),
        }
    }
}

#[async_trait]
impl RecognitionEngine for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(
        &self,
        image: &GrayImage,
        whitelist: &str,
        mode: SegmentationMode,
    ) -> Result<Vec<RecognizedToken>, EngineError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| EngineError::Encode(e.to_string()))?;

        let mut child = Command::new(&self.command)
            .arg("stdin")
            .arg("stdout")
            .args(["-l", &self.lang])
            .args(["--oem", "3"])
            .args(["--psm", &mode.psm().to_string()])
            .args(["-c", &format!("tessedit_char_whitelist={whitelist}")])
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png).await.map_err(EngineError::Spawn)?;
        }

        let output = child.wait_with_output().await.map_err(EngineError::Spawn)?;
        if !output.status.success() {
            return Err(EngineError::Failed(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_tsv_tokens(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Word-level rows (level 5) of Tesseract TSV output.
/// Columns: level page block par line word left top width height conf text
fn parse_tsv_tokens(tsv: &str) -> Vec<RecognizedToken> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 12 || fields[0] != "5" {
                return None;
            }
            let confidence: f64 = fields[10].trim().parse().ok()?;
            let text = fields[11].trim();
            if text.is_empty() {
                return None;
            }
            Some(RecognizedToken::new(text, confidence.max(0.0)))
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to run recognition engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to encode image for recognition: {0}")]
    Encode(String),

    #[error("Recognition engine failed: {0}")]
    Failed(String),

    #[error("Recognition engine timed out after {0:?}")]
    Timeout(Duration),
}
