use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{queue::JobQueue, uploads::ScanStorage};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<ScanStorage>,
    pub queue: Arc<JobQueue>,
}

impl AppState {
    pub fn new(db: PgPool, storage: ScanStorage, queue: Arc<JobQueue>) -> Self {
        Self {
            db,
            storage: Arc::new(storage),
            queue,
        }
    }
}
