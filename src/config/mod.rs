use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::panel::{PanelTable, PanelTableError};

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    #[garde(range(min = 1))]
    pub database_max_connections: u32,

    /// Directory uploaded scans are written to
    #[serde(default = "default_upload_dir")]
    #[garde(length(min = 1))]
    pub upload_dir: String,

    #[serde(default = "default_max_upload_bytes")]
    #[garde(range(min = 1))]
    pub max_upload_bytes: usize,

    /// Path or name of the tesseract executable
    #[serde(default = "default_tesseract_cmd")]
    #[garde(length(min = 1))]
    pub tesseract_cmd: String,

    #[serde(default = "default_tesseract_lang")]
    #[garde(length(min = 1))]
    pub tesseract_lang: String,

    /// Tokens at or below this confidence are dropped before extraction
    #[serde(default = "default_confidence_threshold")]
    #[garde(range(min = 0.0, max = 100.0))]
    pub ocr_confidence_threshold: f64,

    #[serde(default = "default_max_retries")]
    #[garde(range(max = 20))]
    pub ocr_max_retries: u32,

    /// Scans whose shorter side is below this are upscaled to it
    #[serde(default = "default_min_dimension")]
    #[garde(range(min = 1))]
    pub ocr_min_dimension: u32,

    /// Largest preprocessed image, in pixels, a scan may expand to
    #[serde(default = "default_max_pixels")]
    #[garde(range(min = 1))]
    pub ocr_max_pixels: u64,

    /// Optional JSON file replacing the built-in panel table
    #[serde(default)]
    #[garde(skip)]
    pub panel_table_path: Option<String>,

    #[serde(default = "default_worker_concurrency")]
    #[garde(range(min = 1))]
    pub worker_concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    #[garde(range(min = 1))]
    pub queue_capacity: usize,

    #[serde(default = "default_engine_timeout_secs")]
    #[garde(range(min = 1))]
    pub engine_timeout_secs: u64,

    #[serde(default = "default_persist_timeout_secs")]
    #[garde(range(min = 1))]
    pub persist_timeout_secs: u64,

    /// How often a running job refreshes its record. Must stay well below
    /// `STALE_PENDING_SECS` or the sweeper will resubmit live jobs.
    #[serde(default = "default_heartbeat_secs")]
    #[garde(range(min = 1))]
    pub heartbeat_secs: u64,

    /// Sweeper only: age after which a pending record is resubmitted
    #[serde(default = "default_stale_pending_secs")]
    #[garde(range(min = 1))]
    pub stale_pending_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    #[garde(range(min = 1))]
    pub sweep_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_tesseract_cmd() -> String {
    "tesseract".to_string()
}

fn default_tesseract_lang() -> String {
    "eng".to_string()
}

fn default_confidence_threshold() -> f64 {
    60.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_dimension() -> u32 {
    1500
}

fn default_max_pixels() -> u64 {
    50_000_000
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_engine_timeout_secs() -> u64 {
    60
}

fn default_persist_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_stale_pending_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate().map_err(ConfigError::Invalid)?;
        config.check_timing()?;
        Ok(config)
    }

    /// A running job refreshes its record every `heartbeat_secs`; the
    /// sweeper only takes records idle for `stale_pending_secs`.
    fn check_timing(&self) -> Result<(), ConfigError> {
        if self.heartbeat_secs >= self.stale_pending_secs {
            return Err(ConfigError::Inconsistent(format!(
                "HEARTBEAT_SECS ({}) must be below STALE_PENDING_SECS ({})",
                self.heartbeat_secs, self.stale_pending_secs
            )));
        }
        Ok(())
    }

    /// Pipeline knobs derived from the environment.
    pub fn ocr_settings(&self) -> OcrSettings {
        OcrSettings {
            confidence_threshold: self.ocr_confidence_threshold,
            max_retries: self.ocr_max_retries,
            min_dimension: self.ocr_min_dimension,
            max_pixels: self.ocr_max_pixels,
            engine_timeout: Duration::from_secs(self.engine_timeout_secs),
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.worker_concurrency,
            queue_capacity: self.queue_capacity,
            persist_timeout: Duration::from_secs(self.persist_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
        }
    }

    /// Load the configured panel table, falling back to the built-in one.
    pub fn panel_table(&self) -> Result<PanelTable, PanelTableError> {
        match &self.panel_table_path {
            Some(path) => PanelTable::from_json_file(&PathBuf::from(path)),
            None => Ok(PanelTable::default()),
        }
    }
}

/// Settings consumed by the OCR pipeline.
#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub confidence_threshold: f64,
    pub max_retries: u32,
    pub min_dimension: u32,
    pub max_pixels: u64,
    pub engine_timeout: Duration,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_retries: default_max_retries(),
            min_dimension: default_min_dimension(),
            max_pixels: default_max_pixels(),
            engine_timeout: Duration::from_secs(default_engine_timeout_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub persist_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            queue_capacity: default_queue_capacity(),
            persist_timeout: Duration::from_secs(default_persist_timeout_secs()),
            heartbeat_interval: Duration::from_secs(default_heartbeat_secs()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(garde::Report),

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}
