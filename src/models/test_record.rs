use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Per-panel outcome read off the printout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
pub enum Verdict {
    Positive,
    Negative,
    #[serde(rename = "Not Found")]
    #[strum(serialize = "Not Found")]
    NotFound,
}

/// Panel name to verdict. Keys come from the panel table, never from
/// recognized text.
pub type PanelResults = BTreeMap<String, Verdict>;

/// Processing status of a test record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessingStatus::Pending)
    }
}

/// Person administering the test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operator {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Who was tested, by whom, where and when.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestMetadata {
    pub person_id: String,
    pub operator: Operator,
    pub location: Option<Location>,
    pub test_timestamp: DateTime<Utc>,
}

/// A scanned drug-test printout and its OCR outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: Uuid,
    pub scan_reference: String,
    pub scan_hash: String,
    #[serde(flatten)]
    pub metadata: TestMetadata,
    pub ocr_text: String,
    pub panel_results: PanelResults,
    pub confidence: f64,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    /// Pipeline invocation allowed to write the terminal result. Replaced on
    /// every resubmission so a superseded job cannot land its write.
    #[serde(skip)]
    pub invocation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestRecord {
    /// Fresh record as created by the upload path.
    pub fn pending(scan_reference: &str, scan_hash: &str, metadata: TestMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scan_reference: scan_reference.to_string(),
            scan_hash: scan_hash.to_string(),
            metadata,
            ocr_text: String::new(),
            panel_results: PanelResults::new(),
            confidence: 0.0,
            status: ProcessingStatus::Pending,
            error_message: None,
            retry_count: 0,
            invocation_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// The single write a pipeline invocation makes against its record.
///
/// A completed write replaces the OCR result. A failed write leaves the
/// text, confidence and verdicts of the last successful run in place, and
/// only fills `panel_results` when the record has none yet.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalUpdate {
    pub status: ProcessingStatus,
    pub ocr_text: Option<String>,
    pub panel_results: PanelResults,
    pub confidence: Option<f64>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl TerminalUpdate {
    pub fn completed(
        ocr_text: String,
        panel_results: PanelResults,
        confidence: f64,
        retry_count: u32,
    ) -> Self {
        Self {
            status: ProcessingStatus::Completed,
            ocr_text: Some(ocr_text),
            panel_results,
            confidence: Some(confidence),
            retry_count,
            error_message: None,
        }
    }

    /// Failure write; `panels` become `Not Found` if the record has no
    /// earlier verdicts.
    pub fn failed<'a>(
        panels: impl Iterator<Item = &'a str>,
        error: String,
        retry_count: u32,
    ) -> Self {
        Self {
            status: ProcessingStatus::Failed,
            ocr_text: None,
            panel_results: panels.map(|p| (p.to_string(), Verdict::NotFound)).collect(),
            confidence: None,
            retry_count,
            error_message: Some(error),
        }
    }

    /// Whether `panel_results` overwrites what the record already holds.
    pub fn replaces_panels(&self, current: &PanelResults) -> bool {
        self.status == ProcessingStatus::Completed || current.is_empty()
    }

    pub fn apply_to(&self, record: &mut TestRecord) {
        if self.replaces_panels(&record.panel_results) {
            record.panel_results = self.panel_results.clone();
        }
        if let Some(text) = &self.ocr_text {
            record.ocr_text = text.clone();
        }
        if let Some(confidence) = self.confidence {
            record.confidence = confidence;
        }
        record.status = self.status;
        record.retry_count = self.retry_count as i32;
        record.error_message = self.error_message.clone();
        record.updated_at = Utc::now();
    }
}

/// Response after submitting a scan.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: ProcessingStatus,
    pub message: String,
}

/// Response for the status query.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
}

impl From<&TestRecord> for StatusResponse {
    fn from(record: &TestRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            error_message: record.error_message.clone(),
        }
    }
}
