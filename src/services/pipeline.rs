use image::{DynamicImage, GrayImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::OcrSettings;
use crate::models::panel::{PanelTable, PanelTableError};
use crate::models::test_record::PanelResults;
use crate::services::extraction::PanelExtractor;
use crate::services::normalize::TextNormalizer;
use crate::services::preprocess::{self, PreprocessError};
use crate::services::recognition::{self, EngineError, RecognitionEngine};
use crate::services::validation;

/// Result of one preprocess → recognize → normalize → extract pass.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub ocr_text: String,
    pub panel_results: PanelResults,
    pub confidence: f64,
}

/// Accepted outcome of a pipeline invocation, possibly after retries.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub ocr_text: String,
    pub panel_results: PanelResults,
    pub confidence: f64,
    /// Extra attempts consumed beyond the first.
    pub retry_count: u32,
    /// Whether the final attempt passed validation; false when the retry
    /// budget ran out on low-yield attempts.
    pub accepted: bool,
}

/// A terminal pipeline fault and the retries consumed before it occurred.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub retry_count: u32,
}

/// Full OCR extraction pipeline with low-yield retries.
pub struct OcrPipeline {
    engine: Arc<dyn RecognitionEngine>,
    normalizer: TextNormalizer,
    extractor: PanelExtractor,
    settings: OcrSettings,
}

impl OcrPipeline {
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        table: &PanelTable,
        settings: OcrSettings,
    ) -> Result<Self, PanelTableError> {
        Ok(Self {
            engine,
            normalizer: TextNormalizer::new(table.corrections.clone()),
            extractor: PanelExtractor::new(table)?,
            settings,
        })
    }

    pub fn panel_names(&self) -> impl Iterator<Item = &str> {
        self.extractor.panel_names()
    }

    pub fn settings(&self) -> &OcrSettings {
        &self.settings
    }

    /// Decode the scan and run attempts until one passes validation or the
    /// retry budget is spent. Decode and engine faults end the invocation
    /// immediately; only low yield is retried, and each retry starts again
    /// from preprocessing.
    pub async fn run(&self, scan: &Path) -> Result<PipelineOutcome, PipelineFailure> {
        let image = load_blocking(scan.to_path_buf())
            .await
            .map_err(|error| PipelineFailure {
                error,
                retry_count: 0,
            })?;

        let mut retry_count = 0;
        loop {
            let attempt = self
                .attempt(&image)
                .await
                .map_err(|error| PipelineFailure { error, retry_count })?;

            let found = validation::panels_found(&attempt.panel_results);
            let accepted = validation::is_acceptable(&attempt.panel_results);

            tracing::info!(
                attempt = retry_count + 1,
                panels_found = found,
                confidence = attempt.confidence,
                "OCR attempt complete"
            );

            if accepted || retry_count >= self.settings.max_retries {
                if !accepted {
                    tracing::warn!(
                        retry_count,
                        "No panels recognized after exhausting retries, accepting last attempt"
                    );
                }
                return Ok(PipelineOutcome {
                    ocr_text: attempt.ocr_text,
                    panel_results: attempt.panel_results,
                    confidence: attempt.confidence,
                    retry_count,
                    accepted,
                });
            }

            retry_count += 1;
            metrics::counter!("ocr_retries_total").increment(1);
            tracing::warn!(
                retry = retry_count,
                max_retries = self.settings.max_retries,
                "No panels recognized, retrying OCR"
            );
        }
    }

    /// One pass over an already decoded scan.
    pub async fn attempt(&self, image: &Arc<DynamicImage>) -> Result<Attempt, PipelineError> {
        let prepared = preprocess_blocking(
            Arc::clone(image),
            self.settings.min_dimension,
            self.settings.max_pixels,
        )
        .await?;

        let recognition = recognition::recognize_text(
            &self.engine,
            &prepared,
            self.settings.confidence_threshold,
            self.settings.engine_timeout,
        )
        .await?;

        let ocr_text = self.normalizer.normalize(&recognition.raw_text);
        let panel_results = self.extractor.extract(&ocr_text);

        tracing::debug!(text = %ocr_text, "Normalized OCR text");
        for (panel, verdict) in &panel_results {
            tracing::debug!(panel = %panel, verdict = %verdict, "Panel verdict");
        }

        Ok(Attempt {
            ocr_text,
            panel_results,
            confidence: recognition.mean_confidence(),
        })
    }
}

async fn load_blocking(path: PathBuf) -> Result<Arc<DynamicImage>, PipelineError> {
    let image = tokio::task::spawn_blocking(move || preprocess::load_scan(&path))
        .await
        .map_err(|e| PipelineError::Internal(e.to_string()))??;
    Ok(Arc::new(image))
}

async fn preprocess_blocking(
    image: Arc<DynamicImage>,
    min_dimension: u32,
    max_pixels: u64,
) -> Result<GrayImage, PipelineError> {
    let prepared =
        tokio::task::spawn_blocking(move || preprocess::preprocess(&image, min_dimension, max_pixels))
            .await
            .map_err(|e| PipelineError::Internal(e.to_string()))??;
    Ok(prepared)
}

/// Faults that end a pipeline invocation without retry.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] PreprocessError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Internal pipeline fault: {0}")]
    Internal(String),
}
