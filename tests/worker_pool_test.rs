//! Worker pool bounds: concurrency cap, backpressure and shutdown.

mod helpers;

use helpers::*;
use panel_scan::{
    db::store::MemoryRecordStore,
    models::test_record::ProcessingStatus,
    services::queue::{QueueError, ScanJob},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

async fn job(store: &MemoryRecordStore, scan: &Path) -> (Uuid, ScanJob) {
    let job = insert_pending(store, scan).await;
    (job.record_id, job)
}

#[tokio::test]
async fn test_concurrency_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let scan = write_scan(dir.path(), "scan.png");
    let store = Arc::new(MemoryRecordStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(ScriptedEngine::gated(
        vec![words("THC NEG", 90.0)],
        gate.clone(),
    ));
    let queue = start_queue(engine.clone(), store.clone(), 2, 16);

    let mut ids = Vec::new();
    for _ in 0..6 {
        let (id, job) = job(&store, &scan).await;
        assert_ok!(queue.submit(job));
        ids.push(id);
    }

    wait_until(|| engine.calls() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.calls(), 2);

    gate.add_permits(100);
    queue.shutdown().await;

    assert_eq!(engine.calls(), 6);
    assert!(engine.peak_in_flight() <= 2);
    for id in ids {
        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
    }
}

#[tokio::test]
async fn test_full_queue_rejects_new_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let scan = write_scan(dir.path(), "scan.png");
    let store = Arc::new(MemoryRecordStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(ScriptedEngine::gated(
        vec![words("COC POS", 90.0)],
        gate.clone(),
    ));
    let queue = start_queue(engine.clone(), store.clone(), 1, 2);

    // First job occupies the only worker.
    let (first, job_a) = job(&store, &scan).await;
    queue.submit(job_a).unwrap();
    wait_until(|| engine.calls() == 1).await;

    // Second job is pulled by the dispatcher, which then waits for a worker.
    let (second, job_b) = job(&store, &scan).await;
    queue.submit(job_b).unwrap();
    wait_until(|| queue.depth() == 0).await;

    // Two more fill the buffer.
    let (third, job_c) = job(&store, &scan).await;
    let (fourth, job_d) = job(&store, &scan).await;
    queue.submit(job_c).unwrap();
    queue.submit(job_d).unwrap();
    assert_eq!(queue.depth(), 2);

    let (rejected, job_e) = job(&store, &scan).await;
    assert!(matches!(queue.submit(job_e), Err(QueueError::Full)));
    assert!(matches!(queue.reserve(), Err(QueueError::Full)));

    gate.add_permits(100);
    queue.shutdown().await;

    for id in [first, second, third, fourth] {
        assert_eq!(store.get(id).await.unwrap().status, ProcessingStatus::Completed);
    }
    assert_eq!(store.get(rejected).await.unwrap().status, ProcessingStatus::Pending);
    assert_eq!(engine.calls(), 4);
}

#[tokio::test]
async fn test_dropped_reservation_frees_slot() {
    let dir = tempfile::tempdir().unwrap();
    let scan = write_scan(dir.path(), "scan.png");
    let store = Arc::new(MemoryRecordStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(ScriptedEngine::gated(
        vec![words("OPI NEG", 90.0)],
        gate.clone(),
    ));
    let queue = start_queue(engine.clone(), store.clone(), 1, 1);

    let (_, job_a) = job(&store, &scan).await;
    queue.submit(job_a).unwrap();
    wait_until(|| engine.calls() == 1).await;
    let (_, job_b) = job(&store, &scan).await;
    queue.submit(job_b).unwrap();
    wait_until(|| queue.depth() == 0).await;

    let slot = queue.reserve().unwrap();
    assert!(matches!(queue.reserve(), Err(QueueError::Full)));
    drop(slot);
    assert!(queue.reserve().is_ok());

    gate.add_permits(100);
    queue.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let scan = write_scan(dir.path(), "scan.png");
    let store = Arc::new(MemoryRecordStore::new());
    let engine = Arc::new(ScriptedEngine::new(vec![words("AMP NEG", 90.0)]));
    let queue = start_queue(engine.clone(), store.clone(), 1, 8);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (id, job) = job(&store, &scan).await;
        assert_ok!(queue.submit(job));
        ids.push(id);
    }

    queue.shutdown().await;
    for id in ids {
        assert_eq!(store.get(id).await.unwrap().status, ProcessingStatus::Completed);
    }

    let (_, late) = job(&store, &scan).await;
    let err = assert_err!(queue.submit(late));
    assert!(matches!(err, QueueError::Closed));
}
