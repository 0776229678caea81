//! Audio upload rows (one per visit).

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{opt_ts, parse_enum, parse_opt_ts, parse_ts, parse_uuid, placeholders, ts, StoreError};
use crate::domain::{AudioUpload, UploadStatus};

const UPLOAD_COLUMNS: &str = "id, visit_id, storage_path, duration_seconds, file_size_bytes,
    mime_type, status, error_message, uploaded_at, transcription_started_at,
    transcription_completed_at, created_at, updated_at";

/// Create or replace the upload record for a visit (keeps the original id)
pub fn upsert_upload(conn: &Connection, upload: &AudioUpload) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audio_uploads (id, visit_id, storage_path, duration_seconds, file_size_bytes,
         mime_type, status, error_message, uploaded_at, transcription_started_at,
         transcription_completed_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT (visit_id) DO UPDATE SET
            storage_path = excluded.storage_path,
            duration_seconds = excluded.duration_seconds,
            file_size_bytes = excluded.file_size_bytes,
            mime_type = excluded.mime_type,
            status = excluded.status,
            error_message = excluded.error_message,
            uploaded_at = excluded.uploaded_at,
            updated_at = excluded.updated_at",
        params![
            upload.id.to_string(),
            upload.visit_id.to_string(),
            upload.storage_path,
            upload.duration_seconds,
            upload.file_size_bytes,
            upload.mime_type,
            upload.status.as_str(),
            upload.error_message,
            opt_ts(upload.uploaded_at),
            opt_ts(upload.transcription_started_at),
            opt_ts(upload.transcription_completed_at),
            ts(upload.created_at),
            ts(upload.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_upload_for_visit(
    conn: &Connection,
    visit_id: Uuid,
) -> Result<Option<AudioUpload>, StoreError> {
    let sql = format!("SELECT {UPLOAD_COLUMNS} FROM audio_uploads WHERE visit_id = ?1");
    conn.query_row(&sql, params![visit_id.to_string()], |row| {
        Ok(upload_from_row(row))
    })
    .optional()?
    .transpose()
}

/// Compare-and-set on upload status, stamping the timestamp that belongs to `to`
pub fn transition_upload(
    conn: &Connection,
    visit_id: Uuid,
    from: &[UploadStatus],
    to: UploadStatus,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    if from.is_empty() {
        return Ok(false);
    }

    let stamp = match to {
        UploadStatus::Uploaded => ", uploaded_at = ?2",
        UploadStatus::Transcribing => ", transcription_started_at = ?2",
        UploadStatus::Completed => ", transcription_completed_at = ?2",
        _ => "",
    };

    let sql = format!(
        "UPDATE audio_uploads SET status = ?1, updated_at = ?2, error_message = NULL{stamp}
         WHERE visit_id = ?3 AND status IN ({})",
        placeholders(3, from.len())
    );
    let mut values = vec![to.as_str().to_string(), ts(at), visit_id.to_string()];
    values.extend(from.iter().map(|s| s.as_str().to_string()));

    let affected = conn.execute(&sql, params_from_iter(values))?;
    Ok(affected == 1)
}

pub fn mark_upload_failed(
    conn: &Connection,
    visit_id: Uuid,
    message: &str,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE audio_uploads SET status = 'failed', error_message = ?1, updated_at = ?2
         WHERE visit_id = ?3",
        params![message, ts(at), visit_id.to_string()],
    )?;
    Ok(affected == 1)
}

fn upload_from_row(row: &Row<'_>) -> Result<AudioUpload, StoreError> {
    let id: String = row.get(0)?;
    let visit_id: String = row.get(1)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(AudioUpload {
        id: parse_uuid("upload id", &id)?,
        visit_id: parse_uuid("upload visit_id", &visit_id)?,
        storage_path: row.get(2)?,
        duration_seconds: row.get(3)?,
        file_size_bytes: row.get(4)?,
        mime_type: row.get(5)?,
        status: parse_enum(&status)?,
        error_message: row.get(7)?,
        uploaded_at: parse_opt_ts("uploaded_at", row.get(8)?)?,
        transcription_started_at: parse_opt_ts("transcription_started_at", row.get(9)?)?,
        transcription_completed_at: parse_opt_ts("transcription_completed_at", row.get(10)?)?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}
