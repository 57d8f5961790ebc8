use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::WorkerPoolConfig;
use crate::models::test_record::TestRecord;
use crate::services::runner::JobRunner;

/// One pipeline invocation: a stored scan and the record it reports to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanJob {
    pub record_id: Uuid,
    /// Must match the record's current invocation for the result to land.
    pub invocation_id: Uuid,
    pub scan_reference: PathBuf,
}

impl ScanJob {
    pub fn for_record(record: &TestRecord) -> Self {
        Self {
            record_id: record.id,
            invocation_id: record.invocation_id,
            scan_reference: PathBuf::from(&record.scan_reference),
        }
    }
}

/// Bounded in-process job queue feeding a fixed-size worker pool.
///
/// Submissions never wait: once `queue_capacity` jobs are buffered the
/// queue rejects new work with [`QueueError::Full`].
pub struct JobQueue {
    sender: mpsc::Sender<ScanJob>,
    capacity: usize,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// A reserved queue slot; dropping it releases the slot unused.
pub struct QueueSlot<'a> {
    permit: mpsc::Permit<'a, ScanJob>,
    queue: &'a JobQueue,
}

impl QueueSlot<'_> {
    pub fn submit(self, job: ScanJob) {
        tracing::info!(record_id = %job.record_id, "Scan queued for OCR");
        self.permit.send(job);
        metrics::counter!("ocr_jobs_submitted_total").increment(1);
        metrics::gauge!("ocr_queue_depth").set(self.queue.depth() as f64);
    }
}

impl JobQueue {
    /// Spawn the dispatcher and return the submission handle.
    pub fn start(runner: Arc<JobRunner>, config: &WorkerPoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch(
            receiver,
            shutdown_rx,
            runner,
            config.concurrency,
        ));

        tracing::info!(
            workers = config.concurrency,
            capacity = config.queue_capacity,
            "OCR worker pool started"
        );

        Self {
            sender,
            capacity: config.queue_capacity,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Enqueue one pipeline run. Completion is observable only through the
    /// record's persisted status.
    pub fn submit(&self, job: ScanJob) -> Result<(), QueueError> {
        self.reserve()?.submit(job);
        Ok(())
    }

    /// Claim a slot before doing work that should only happen if the job
    /// can be accepted.
    pub fn reserve(&self) -> Result<QueueSlot<'_>, QueueError> {
        match self.sender.try_reserve() {
            Ok(permit) => Ok(QueueSlot {
                permit,
                queue: self,
            }),
            Err(mpsc::error::TrySendError::Full(())) => {
                metrics::counter!("ocr_jobs_rejected_total").increment(1);
                tracing::warn!(capacity = self.capacity, "OCR queue full, rejecting job");
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(())) => Err(QueueError::Closed),
        }
    }

    /// Jobs buffered and not yet picked up by a worker.
    pub fn depth(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting jobs, finish everything already queued and wait for
    /// in-flight jobs.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "OCR dispatcher terminated abnormally");
            }
        }
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<ScanJob>,
    mut shutdown: watch::Receiver<bool>,
    runner: Arc<JobRunner>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();
    let mut closing = false;

    loop {
        let job = tokio::select! {
            job = receiver.recv() => job,
            _ = shutdown.changed(), if !closing => {
                // Buffered jobs are still drained after close.
                closing = true;
                receiver.close();
                continue;
            }
        };
        let Some(job) = job else { break };

        // Waiting here is what lets the channel fill up and push back.
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        metrics::gauge!("ocr_queue_depth").set(receiver.len() as f64);

        let runner = Arc::clone(&runner);
        let span = tracing::info_span!("ocr_job", record_id = %job.record_id);
        tasks.spawn(
            async move {
                let _permit = permit;
                runner.run(&job).await;
            }
            .instrument(span),
        );

        while let Some(result) = tasks.try_join_next() {
            log_join(result);
        }
    }

    while let Some(result) = tasks.join_next().await {
        log_join(result);
    }
    tracing::info!("OCR worker pool stopped");
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "OCR job task panicked");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("OCR queue is full")]
    Full,

    #[error("OCR queue is shut down")]
    Closed,
}
