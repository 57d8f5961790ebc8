use panel_scan::{
    config::AppConfig,
    db::{self, queries, store::PgRecordStore},
    services::{
        pipeline::OcrPipeline,
        queue::{JobQueue, ScanJob},
        recognition::TesseractCli,
        runner::JobRunner,
    },
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Re-submits records left `pending` longer than `STALE_PENDING_SECS`, e.g.
/// when a server restart dropped its in-memory queue.
#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting pending-record sweeper");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    let panel_table = config.panel_table().expect("Failed to load panel table");
    let engine = Arc::new(TesseractCli::new(&config.tesseract_cmd, &config.tesseract_lang));
    let pipeline = OcrPipeline::new(engine, &panel_table, config.ocr_settings())
        .expect("Failed to compile panel table");

    let pool_config = config.worker_pool();
    let runner = JobRunner::new(
        Arc::new(pipeline),
        Arc::new(PgRecordStore::new(db_pool.clone())),
        &pool_config,
    );
    let queue = JobQueue::start(Arc::new(runner), &pool_config);

    let interval = Duration::from_secs(config.sweep_interval_secs);
    let stale_secs = config.stale_pending_secs as i64;

    tracing::info!(interval_secs = config.sweep_interval_secs, "Sweeper ready");

    loop {
        match sweep(&db_pool, &queue, stale_secs).await {
            Ok(0) => tracing::trace!("No stale pending records"),
            Ok(n) => tracing::info!(resubmitted = n, "Resubmitted stale pending records"),
            Err(e) => tracing::error!(error = %e, "Sweep failed, will retry"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Draining OCR queue");
    queue.shutdown().await;
}

/// Submit as many stale pending records as the queue has room for.
async fn sweep(pool: &PgPool, queue: &JobQueue, stale_secs: i64) -> Result<usize, sqlx::Error> {
    let room = queue.capacity().saturating_sub(queue.depth());
    if room == 0 {
        return Ok(0);
    }

    let records = queries::find_stale_pending(pool, stale_secs, room as i64).await?;
    let mut submitted = 0;

    for mut record in records {
        // Hold a slot first: a claimed record must always get its job.
        let Ok(slot) = queue.reserve() else { break };

        // A new invocation id supersedes any runner still holding the
        // record; the claim fails if that runner heartbeated meanwhile.
        let invocation_id = Uuid::new_v4();
        if !queries::claim_stale(pool, record.id, stale_secs, invocation_id).await? {
            continue;
        }

        record.invocation_id = invocation_id;
        slot.submit(ScanJob::for_record(&record));
        submitted += 1;
    }

    Ok(submitted)
}
