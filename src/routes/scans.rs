use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::metadata::{MetadataError, MetadataUpdate, UploadFields};
use crate::models::test_record::{StatusResponse, SubmitResponse, TestRecord};
use crate::services::queue::{QueueError, ScanJob};
use crate::services::uploads::UploadError;

fn queue_status(e: QueueError) -> StatusCode {
    match e {
        QueueError::Full | QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn metadata_error(e: MetadataError) -> StatusCode {
    tracing::warn!(error = %e, "Rejected test metadata");
    StatusCode::BAD_REQUEST
}

fn database_error(e: sqlx::Error) -> StatusCode {
    tracing::error!(error = %e, "Database query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// POST /api/v1/scans — Upload a printout scan and queue it for OCR.
pub async fn submit_scan(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut fields = UploadFields::default();

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
            upload = Some((filename, data.to_vec()));
        } else {
            let value = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
            fields.set(&name, value).map_err(metadata_error)?;
        }
    }

    let (filename, data) = upload.ok_or(StatusCode::BAD_REQUEST)?;
    let metadata = fields.into_metadata(Utc::now()).map_err(metadata_error)?;

    // Claim queue capacity first so a full queue never leaves a pending record behind.
    let slot = state.queue.reserve().map_err(queue_status)?;

    let stored = state.storage.save(&filename, &data).await.map_err(|e| {
        tracing::warn!(error = %e, filename = %filename, "Rejected scan upload");
        match e {
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::UnsupportedType(_) | UploadError::NotAnImage => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            UploadError::Empty => StatusCode::BAD_REQUEST,
            UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    })?;

    let record = TestRecord::pending(&stored.path.to_string_lossy(), &stored.hash, metadata);
    queries::create_record(&state.db, &record)
        .await
        .map_err(database_error)?;

    slot.submit(ScanJob::for_record(&record));

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id: record.id,
            status: record.status,
            message: "Scan submitted for processing".to_string(),
        }),
    ))
}

/// GET /api/v1/scans/{id} — Full test record.
pub async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TestRecord>, StatusCode> {
    queries::get_record(&state.db, id)
        .await
        .map_err(database_error)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/v1/scans/{id}/status — Processing status only.
pub async fn get_scan_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let record = queries::get_record(&state.db, id)
        .await
        .map_err(database_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(StatusResponse::from(&record)))
}

/// POST /api/v1/scans/{id}/reprocess — Run OCR again on a finished record.
pub async fn reprocess_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let slot = state.queue.reserve().map_err(queue_status)?;

    let Some(record) = queries::reset_for_reprocess(&state.db, id)
        .await
        .map_err(database_error)?
    else {
        // Either unknown, or already pending and owned by a running invocation.
        return match queries::get_record(&state.db, id).await.map_err(database_error)? {
            Some(_) => Err(StatusCode::CONFLICT),
            None => Err(StatusCode::NOT_FOUND),
        };
    };

    slot.submit(ScanJob::for_record(&record));

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id: record.id,
            status: record.status,
            message: "Scan resubmitted for processing".to_string(),
        }),
    ))
}

/// POST /api/v1/scans/{id}/metadata — Correct who, where and when for a test.
///
/// OCR fields are untouched, so this is allowed in any processing status.
pub async fn update_scan_metadata(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<MetadataUpdate>,
) -> Result<Json<TestRecord>, StatusCode> {
    let patch = update.into_patch().map_err(metadata_error)?;
    let record = queries::update_metadata(&state.db, id, &patch)
        .await
        .map_err(database_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    tracing::info!(record_id = %id, "Updated test metadata");
    Ok(Json(record))
}
