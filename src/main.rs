use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use panel_scan::{
    app_state::AppState,
    config::AppConfig,
    db::{self, store::PgRecordStore},
    routes,
    services::{
        pipeline::OcrPipeline, queue::JobQueue, recognition::TesseractCli, runner::JobRunner,
        uploads::ScanStorage,
    },
};

/// Multipart framing on top of the scan itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing panel-scan server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let panel_table = config.panel_table().expect("Failed to load panel table");
    tracing::info!(
        panels = panel_table.panels.len(),
        corrections = panel_table.corrections.len(),
        "Loaded panel table"
    );

    let engine = Arc::new(TesseractCli::new(&config.tesseract_cmd, &config.tesseract_lang));
    let pipeline = OcrPipeline::new(engine, &panel_table, config.ocr_settings())
        .expect("Failed to compile panel table");

    let pool_config = config.worker_pool();
    let runner = JobRunner::new(
        Arc::new(pipeline),
        Arc::new(PgRecordStore::new(db_pool.clone())),
        &pool_config,
    );
    let queue = Arc::new(JobQueue::start(Arc::new(runner), &pool_config));

    let storage = ScanStorage::new(&config.upload_dir, config.max_upload_bytes);
    let state = AppState::new(db_pool, storage, Arc::clone(&queue));

    let app = routes::api_router(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(
            config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES,
        ));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Draining OCR queue");
    queue.shutdown().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
