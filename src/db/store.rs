use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::queries;
use crate::models::test_record::{TerminalUpdate, TestRecord};

/// Whether an invocation still owns its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClaim {
    /// Pending under this invocation; `updated_at` was refreshed.
    Current,
    /// Finished, or handed to a newer invocation.
    Superseded,
    /// No record with this id.
    Missing,
}

/// Persistence collaborator used by the job runner.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Apply the terminal write for `id`. Returns `false` when no record is
    /// pending under `invocation_id` (deleted, finished, or superseded).
    async fn update_by_id(
        &self,
        id: Uuid,
        invocation_id: Uuid,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError>;

    /// Mark the invocation as alive so the sweeper leaves the record alone.
    async fn heartbeat(&self, id: Uuid, invocation_id: Uuid) -> Result<JobClaim, StoreError>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn update_by_id(
        &self,
        id: Uuid,
        invocation_id: Uuid,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError> {
        Ok(queries::apply_terminal_update(&self.pool, id, invocation_id, update).await?)
    }

    async fn heartbeat(&self, id: Uuid, invocation_id: Uuid) -> Result<JobClaim, StoreError> {
        if queries::heartbeat(&self.pool, id, invocation_id).await? {
            return Ok(JobClaim::Current);
        }
        if queries::record_exists(&self.pool, id).await? {
            Ok(JobClaim::Superseded)
        } else {
            Ok(JobClaim::Missing)
        }
    }
}

/// In-process store with the same ownership rules as the database.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<Uuid, TestRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: TestRecord) {
        self.records.write().await.insert(record.id, record);
    }

    pub async fn get(&self, id: Uuid) -> Option<TestRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<TestRecord> {
        self.records.write().await.remove(&id)
    }

    /// Give a pending record to a new invocation, as the sweeper does.
    pub async fn reassign(&self, id: Uuid) -> Option<Uuid> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).filter(|r| !r.status.is_terminal())?;
        record.invocation_id = Uuid::new_v4();
        record.updated_at = Utc::now();
        Some(record.invocation_id)
    }
}

fn owned(record: &TestRecord, invocation_id: Uuid) -> bool {
    !record.status.is_terminal() && record.invocation_id == invocation_id
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn update_by_id(
        &self,
        id: Uuid,
        invocation_id: Uuid,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if owned(record, invocation_id) => {
                update.apply_to(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, id: Uuid, invocation_id: Uuid) -> Result<JobClaim, StoreError> {
        let mut records = self.records.write().await;
        Ok(match records.get_mut(&id) {
            Some(record) if owned(record, invocation_id) => {
                record.updated_at = Utc::now();
                JobClaim::Current
            }
            Some(_) => JobClaim::Superseded,
            None => JobClaim::Missing,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
