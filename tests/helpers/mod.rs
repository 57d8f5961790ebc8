//! Test helper utilities for pipeline and worker-pool tests

#![allow(dead_code)]

use async_trait::async_trait;
use image::{GrayImage, ImageFormat, Luma};
use panel_scan::{
    config::{OcrSettings, WorkerPoolConfig},
    db::store::{MemoryRecordStore, RecordStore},
    models::{
        panel::PanelTable,
        test_record::{Operator, ProcessingStatus, TestMetadata, TestRecord},
    },
    services::{
        pipeline::OcrPipeline,
        queue::{JobQueue, ScanJob},
        recognition::{EngineError, RecognitionEngine, RecognizedToken, SegmentationMode},
        runner::JobRunner,
    },
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// One scripted engine response.
#[derive(Clone)]
pub enum Step {
    Tokens(Vec<RecognizedToken>),
    Fault(String),
}

pub fn words(text: &str, confidence: f64) -> Step {
    Step::Tokens(
        text.split_whitespace()
            .map(|w| RecognizedToken::new(w, confidence))
            .collect(),
    )
}

/// Engine replaying a script, repeating its last step. Optionally each call
/// must first take a permit from `gate`, which lets tests hold jobs in flight.
pub struct ScriptedEngine {
    script: Vec<Step>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(script: Vec<Step>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(script)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recognize(
        &self,
        _image: &GrayImage,
        _whitelist: &str,
        _mode: SegmentationMode,
    ) -> Result<Vec<RecognizedToken>, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &self.script[call.min(self.script.len() - 1)] {
            Step::Tokens(tokens) => Ok(tokens.clone()),
            Step::Fault(message) => Err(EngineError::Failed(message.clone())),
        }
    }
}

pub fn test_settings() -> OcrSettings {
    OcrSettings {
        min_dimension: 32,
        engine_timeout: Duration::from_secs(5),
        ..OcrSettings::default()
    }
}

/// Write a small synthetic printout scan.
pub fn write_scan(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    GrayImage::from_fn(40, 24, |x, y| {
        if (x / 4 + y / 4) % 2 == 0 {
            Luma([30])
        } else {
            Luma([220])
        }
    })
    .save_with_format(&path, ImageFormat::Png)
    .expect("write scan");
    path
}

pub fn build_runner(engine: Arc<ScriptedEngine>, store: Arc<dyn RecordStore>) -> Arc<JobRunner> {
    let pipeline = OcrPipeline::new(engine, &PanelTable::default(), test_settings())
        .expect("default panel table compiles");
    Arc::new(JobRunner::new(Arc::new(pipeline), store, &pool_config(1, 8)))
}

pub fn pool_config(concurrency: usize, queue_capacity: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency,
        queue_capacity,
        persist_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(1),
    }
}

pub fn start_queue(
    engine: Arc<ScriptedEngine>,
    store: Arc<MemoryRecordStore>,
    concurrency: usize,
    queue_capacity: usize,
) -> JobQueue {
    let runner = build_runner(engine, store);
    JobQueue::start(runner, &pool_config(concurrency, queue_capacity))
}

pub fn test_metadata(person_id: &str) -> TestMetadata {
    TestMetadata {
        person_id: person_id.to_string(),
        operator: Operator {
            id: "op-7".to_string(),
            name: "Dana Reyes".to_string(),
        },
        location: None,
        test_timestamp: chrono::Utc::now(),
    }
}

/// Store a pending record for `scan` and return the job that owns it.
pub async fn insert_pending(store: &MemoryRecordStore, scan: &Path) -> ScanJob {
    let record = TestRecord::pending(&scan.to_string_lossy(), "test-hash", test_metadata("P-1001"));
    let job = ScanJob::for_record(&record);
    store.insert(record).await;
    job
}

/// Poll until the record leaves `pending`.
pub async fn wait_for_terminal(store: &MemoryRecordStore, id: Uuid) -> TestRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(record) = store.get(id).await {
                if record.status != ProcessingStatus::Pending {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("record never reached a terminal status")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
