use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::metadata::MetadataPatch;
use crate::models::test_record::{
    Location, Operator, PanelResults, ProcessingStatus, TerminalUpdate, TestMetadata, TestRecord,
};

const RECORD_COLUMNS: &str = r#"
    id, scan_reference, scan_hash, person_id, operator_id, operator_name,
    latitude, longitude, test_timestamp, ocr_text, panel_results, confidence,
    status, error_message, retry_count, invocation_id, created_at, updated_at
"#;

fn record_from_row(row: &PgRow) -> Result<TestRecord, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = ProcessingStatus::from_str(&status_str).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;
    let Json(panel_results): Json<PanelResults> = row.try_get("panel_results")?;

    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let location = latitude.zip(longitude).map(|(latitude, longitude)| Location {
        latitude,
        longitude,
    });

    Ok(TestRecord {
        id: row.try_get("id")?,
        scan_reference: row.try_get("scan_reference")?,
        scan_hash: row.try_get("scan_hash")?,
        metadata: TestMetadata {
            person_id: row.try_get("person_id")?,
            operator: Operator {
                id: row.try_get("operator_id")?,
                name: row.try_get("operator_name")?,
            },
            location,
            test_timestamp: row.try_get("test_timestamp")?,
        },
        ocr_text: row.try_get("ocr_text")?,
        panel_results,
        confidence: row.try_get("confidence")?,
        status,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        invocation_id: row.try_get("invocation_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new pending test record
pub async fn create_record(pool: &PgPool, record: &TestRecord) -> Result<(), sqlx::Error> {
    let metadata = &record.metadata;
    sqlx::query(
        r#"
        INSERT INTO test_records (
            id, scan_reference, scan_hash, person_id, operator_id, operator_name,
            latitude, longitude, test_timestamp, invocation_id, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending')
        "#,
    )
    .bind(record.id)
    .bind(&record.scan_reference)
    .bind(&record.scan_hash)
    .bind(&metadata.person_id)
    .bind(&metadata.operator.id)
    .bind(&metadata.operator.name)
    .bind(metadata.location.map(|l| l.latitude))
    .bind(metadata.location.map(|l| l.longitude))
    .bind(metadata.test_timestamp)
    .bind(record.invocation_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a record by ID
pub async fn get_record(pool: &PgPool, id: Uuid) -> Result<Option<TestRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM test_records WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Apply the terminal write of a pipeline invocation.
///
/// Only a `pending` record still owned by `invocation_id` is updated, so
/// every invocation produces at most one `pending -> completed|failed`
/// transition and a superseded one produces none. A failed write keeps the
/// text, confidence and verdicts of an earlier successful run. Returns
/// whether a row was modified.
pub async fn apply_terminal_update(
    pool: &PgPool,
    id: Uuid,
    invocation_id: Uuid,
    update: &TerminalUpdate,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE test_records
        SET status = $1::text,
            ocr_text = COALESCE($2, ocr_text),
            panel_results = CASE
                WHEN $1::text = 'completed' OR panel_results = '{}'::jsonb THEN $3
                ELSE panel_results
            END,
            confidence = COALESCE($4, confidence),
            retry_count = $5,
            error_message = $6,
            updated_at = NOW()
        WHERE id = $7 AND invocation_id = $8 AND status = 'pending'
        "#,
    )
    .bind(update.status.to_string())
    .bind(update.ocr_text.as_deref())
    .bind(Json(&update.panel_results))
    .bind(update.confidence)
    .bind(update.retry_count as i32)
    .bind(update.error_message.as_deref())
    .bind(id)
    .bind(invocation_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move a finished record back to `pending` under a fresh invocation.
/// Returns the record when it existed and was not already pending.
pub async fn reset_for_reprocess(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<TestRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE test_records
        SET status = 'pending',
            error_message = NULL,
            retry_count = 0,
            invocation_id = $2,
            updated_at = NOW()
        WHERE id = $1 AND status <> 'pending'
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(Uuid::new_v4())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Overwrite the metadata groups present in `patch`. Returns the updated
/// record, or `None` for an unknown id.
pub async fn update_metadata(
    pool: &PgPool,
    id: Uuid,
    patch: &MetadataPatch,
) -> Result<Option<TestRecord>, sqlx::Error> {
    let operator = patch.operator.as_ref();
    let row = sqlx::query(&format!(
        r#"
        UPDATE test_records
        SET person_id = COALESCE($2, person_id),
            operator_id = COALESCE($3, operator_id),
            operator_name = COALESCE($4, operator_name),
            latitude = COALESCE($5, latitude),
            longitude = COALESCE($6, longitude),
            test_timestamp = COALESCE($7, test_timestamp)
        WHERE id = $1
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(patch.person_id.as_deref())
    .bind(operator.map(|o| o.id.as_str()))
    .bind(operator.map(|o| o.name.as_str()))
    .bind(patch.location.map(|l| l.latitude))
    .bind(patch.location.map(|l| l.longitude))
    .bind(patch.test_timestamp)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Pending records untouched for at least `stale_secs` (for the sweeper)
pub async fn find_stale_pending(
    pool: &PgPool,
    stale_secs: i64,
    limit: i64,
) -> Result<Vec<TestRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {RECORD_COLUMNS}
        FROM test_records
        WHERE status = 'pending'
          AND updated_at < NOW() - make_interval(secs => $1)
        ORDER BY updated_at ASC
        LIMIT $2
        "#
    ))
    .bind(stale_secs as f64)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Hand a stale pending record to a new invocation.
///
/// Staleness is checked again in the same statement, so a record whose
/// runner heartbeated since it was listed is left alone.
pub async fn claim_stale(
    pool: &PgPool,
    id: Uuid,
    stale_secs: i64,
    invocation_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE test_records
        SET invocation_id = $2,
            updated_at = NOW()
        WHERE id = $1
          AND status = 'pending'
          AND updated_at < NOW() - make_interval(secs => $3)
        "#,
    )
    .bind(id)
    .bind(invocation_id)
    .bind(stale_secs as f64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Refresh `updated_at` for a running invocation. Returns `false` when the
/// record is no longer pending under `invocation_id`.
pub async fn heartbeat(
    pool: &PgPool,
    id: Uuid,
    invocation_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE test_records
        SET updated_at = NOW()
        WHERE id = $1 AND invocation_id = $2 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(invocation_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn record_exists(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM test_records WHERE id = $1)")
        .bind(id)
        .fetch_one(pool)
        .await
}
