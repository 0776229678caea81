//! Provider and patient notes (one of each per visit).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_enum, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, ts, StoreError};
use crate::domain::{PatientNote, ProviderNote};

/// Store the transcript, creating the draft provider note if needed
pub fn save_transcript(
    conn: &Connection,
    visit_id: Uuid,
    transcript: &str,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO provider_notes (id, visit_id, transcript, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'draft', ?4, ?4)
         ON CONFLICT (visit_id) DO UPDATE SET transcript = excluded.transcript,
            updated_at = excluded.updated_at",
        params![
            Uuid::new_v4().to_string(),
            visit_id.to_string(),
            transcript,
            ts(at)
        ],
    )?;
    Ok(())
}

/// Store generated provider note content (draft)
pub fn save_provider_content(
    conn: &Connection,
    visit_id: Uuid,
    content: &str,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO provider_notes (id, visit_id, content, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'draft', ?4, ?4)
         ON CONFLICT (visit_id) DO UPDATE SET content = excluded.content,
            updated_at = excluded.updated_at",
        params![
            Uuid::new_v4().to_string(),
            visit_id.to_string(),
            content,
            ts(at)
        ],
    )?;
    Ok(())
}

/// Store generated patient note content (draft)
pub fn save_patient_content(
    conn: &Connection,
    visit_id: Uuid,
    content: &str,
    language: &str,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO patient_notes (id, visit_id, content, language, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?5)
         ON CONFLICT (visit_id) DO UPDATE SET content = excluded.content,
            language = excluded.language, updated_at = excluded.updated_at",
        params![
            Uuid::new_v4().to_string(),
            visit_id.to_string(),
            content,
            language,
            ts(at)
        ],
    )?;
    Ok(())
}

/// Edit provider note content; only drafts are editable
pub fn edit_provider_content(
    conn: &Connection,
    visit_id: Uuid,
    content: &str,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE provider_notes SET content = ?1, updated_at = ?2
         WHERE visit_id = ?3 AND status = 'draft'",
        params![content, ts(at), visit_id.to_string()],
    )?;
    Ok(affected == 1)
}

/// Edit patient note content; only drafts are editable
pub fn edit_patient_content(
    conn: &Connection,
    visit_id: Uuid,
    content: &str,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE patient_notes SET content = ?1, updated_at = ?2
         WHERE visit_id = ?3 AND status = 'draft'",
        params![content, ts(at), visit_id.to_string()],
    )?;
    Ok(affected == 1)
}

/// Mark both notes finalized
pub fn finalize_notes(
    conn: &Connection,
    visit_id: Uuid,
    finalized_by: Uuid,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE provider_notes SET status = 'finalized', finalized_at = ?1, finalized_by = ?2,
         updated_at = ?1 WHERE visit_id = ?3",
        params![ts(at), finalized_by.to_string(), visit_id.to_string()],
    )?;
    conn.execute(
        "UPDATE patient_notes SET status = 'finalized', updated_at = ?1 WHERE visit_id = ?2",
        params![ts(at), visit_id.to_string()],
    )?;
    Ok(())
}

pub fn get_provider_note(
    conn: &Connection,
    visit_id: Uuid,
) -> Result<Option<ProviderNote>, StoreError> {
    conn.query_row(
        "SELECT id, visit_id, transcript, content, status, finalized_at, finalized_by,
         created_at, updated_at FROM provider_notes WHERE visit_id = ?1",
        params![visit_id.to_string()],
        |row| Ok(provider_note_from_row(row)),
    )
    .optional()?
    .transpose()
}

pub fn get_patient_note(
    conn: &Connection,
    visit_id: Uuid,
) -> Result<Option<PatientNote>, StoreError> {
    conn.query_row(
        "SELECT id, visit_id, content, language, status, created_at, updated_at
         FROM patient_notes WHERE visit_id = ?1",
        params![visit_id.to_string()],
        |row| Ok(patient_note_from_row(row)),
    )
    .optional()?
    .transpose()
}

fn provider_note_from_row(row: &Row<'_>) -> Result<ProviderNote, StoreError> {
    let id: String = row.get(0)?;
    let visit_id: String = row.get(1)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(ProviderNote {
        id: parse_uuid("provider note id", &id)?,
        visit_id: parse_uuid("provider note visit_id", &visit_id)?,
        transcript: row.get(2)?,
        content: row.get(3)?,
        status: parse_enum(&status)?,
        finalized_at: parse_opt_ts("finalized_at", row.get(5)?)?,
        finalized_by: parse_opt_uuid("finalized_by", row.get(6)?)?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

fn patient_note_from_row(row: &Row<'_>) -> Result<PatientNote, StoreError> {
    let id: String = row.get(0)?;
    let visit_id: String = row.get(1)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(PatientNote {
        id: parse_uuid("patient note id", &id)?,
        visit_id: parse_uuid("patient note visit_id", &visit_id)?,
        content: row.get(2)?,
        language: row.get(3)?,
        status: parse_enum(&status)?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}
