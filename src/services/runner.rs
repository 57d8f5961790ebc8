use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

use crate::config::WorkerPoolConfig;
use crate::db::store::{JobClaim, RecordStore};
use crate::models::test_record::{ProcessingStatus, TerminalUpdate};
use crate::services::pipeline::OcrPipeline;
use crate::services::queue::ScanJob;

/// What happened to the terminal write of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Written,
    /// No pending record matched the identifier and invocation.
    NoMatch,
    /// A newer invocation owns the record; nothing was written.
    Superseded,
    Fault(String),
}

/// Outcome of one job, for logs and tests. Callers never see it.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// `None` when the job was dropped before producing a result.
    pub update: Option<TerminalUpdate>,
    pub persisted: PersistOutcome,
}

impl JobReport {
    fn superseded() -> Self {
        Self {
            update: None,
            persisted: PersistOutcome::Superseded,
        }
    }
}

/// Runs the pipeline for one scan and performs the single terminal write.
///
/// While the pipeline runs the record's `updated_at` is refreshed every
/// `heartbeat_interval`, which keeps the backlog sweeper from treating the
/// record as abandoned.
pub struct JobRunner {
    pipeline: Arc<OcrPipeline>,
    store: Arc<dyn RecordStore>,
    persist_timeout: Duration,
    heartbeat_interval: Duration,
}

impl JobRunner {
    pub fn new(
        pipeline: Arc<OcrPipeline>,
        store: Arc<dyn RecordStore>,
        config: &WorkerPoolConfig,
    ) -> Self {
        Self {
            pipeline,
            store,
            persist_timeout: config.persist_timeout,
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    pub async fn run(&self, job: &ScanJob) -> JobReport {
        tracing::info!(
            record_id = %job.record_id,
            invocation_id = %job.invocation_id,
            scan = %job.scan_reference.display(),
            "Processing scan"
        );

        if self.claim(job).await == Some(JobClaim::Superseded) {
            self.log_superseded(job);
            return JobReport::superseded();
        }

        let start = Instant::now();
        let Some(result) = self.with_heartbeat(job, self.pipeline.run(&job.scan_reference)).await
        else {
            self.log_superseded(job);
            return JobReport::superseded();
        };

        let update = match result {
            Ok(outcome) => {
                tracing::info!(
                    record_id = %job.record_id,
                    retry_count = outcome.retry_count,
                    accepted = outcome.accepted,
                    confidence = outcome.confidence,
                    "OCR completed"
                );
                TerminalUpdate::completed(
                    outcome.ocr_text,
                    outcome.panel_results,
                    outcome.confidence,
                    outcome.retry_count,
                )
            }
            Err(failure) => {
                tracing::error!(
                    record_id = %job.record_id,
                    retry_count = failure.retry_count,
                    error = %failure,
                    "OCR processing failed"
                );
                TerminalUpdate::failed(
                    self.pipeline.panel_names(),
                    failure.to_string(),
                    failure.retry_count,
                )
            }
        };

        metrics::histogram!("ocr_processing_seconds").record(start.elapsed().as_secs_f64());
        match update.status {
            ProcessingStatus::Failed => metrics::counter!("ocr_jobs_failed_total").increment(1),
            _ => metrics::counter!("ocr_jobs_completed_total").increment(1),
        }

        let persisted = self.persist(job, &update).await;
        JobReport {
            update: Some(update),
            persisted,
        }
    }

    /// Drive `work` to completion, heartbeating on the side. Returns `None`
    /// if the record is handed to another invocation meanwhile.
    async fn with_heartbeat<F: Future>(&self, job: &ScanJob, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        let period = self.heartbeat_interval;
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                _ = ticks.tick() => {
                    if self.claim(job).await == Some(JobClaim::Superseded) {
                        return None;
                    }
                }
            }
        }
    }

    /// Heartbeat the record. Store faults are logged and reported as `None`;
    /// the job keeps going and its terminal write settles ownership.
    async fn claim(&self, job: &ScanJob) -> Option<JobClaim> {
        let beat = self.store.heartbeat(job.record_id, job.invocation_id);
        match tokio::time::timeout(self.persist_timeout, beat).await {
            Ok(Ok(claim)) => Some(claim),
            Ok(Err(e)) => {
                tracing::warn!(record_id = %job.record_id, error = %e, "Heartbeat failed");
                None
            }
            Err(_) => {
                tracing::warn!(record_id = %job.record_id, "Heartbeat timed out");
                None
            }
        }
    }

    fn log_superseded(&self, job: &ScanJob) {
        metrics::counter!("ocr_jobs_superseded_total").increment(1);
        tracing::warn!(
            record_id = %job.record_id,
            invocation_id = %job.invocation_id,
            "Record owned by a newer invocation, dropping OCR job"
        );
    }

    async fn persist(&self, job: &ScanJob, update: &TerminalUpdate) -> PersistOutcome {
        let write = self
            .store
            .update_by_id(job.record_id, job.invocation_id, update);
        let outcome = match tokio::time::timeout(self.persist_timeout, write).await {
            Ok(Ok(true)) => PersistOutcome::Written,
            Ok(Ok(false)) => PersistOutcome::NoMatch,
            Ok(Err(e)) => PersistOutcome::Fault(e.to_string()),
            Err(_) => PersistOutcome::Fault(format!(
                "terminal write timed out after {:?}",
                self.persist_timeout
            )),
        };

        match &outcome {
            PersistOutcome::Written => tracing::info!(
                record_id = %job.record_id,
                status = %update.status,
                "Stored OCR result"
            ),
            PersistOutcome::NoMatch | PersistOutcome::Superseded => {
                metrics::counter!("ocr_persistence_faults_total").increment(1);
                tracing::error!(
                    record_id = %job.record_id,
                    "Failed to store OCR result: no pending record matched"
                );
            }
            PersistOutcome::Fault(error) => {
                metrics::counter!("ocr_persistence_faults_total").increment(1);
                tracing::error!(
                    record_id = %job.record_id,
                    error = %error,
                    "Failed to store OCR result"
                );
            }
        }

        outcome
    }
}
