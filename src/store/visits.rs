//! Visit rows: check-in, conditional queue/processing updates, board reads.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    parse_date, parse_enum, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid,
    placeholders, ts, StoreError,
};
use crate::domain::{ClinicalFields, Priority, ProcessingStatus, QueueStatus, Stage, Visit};

const VISIT_COLUMNS: &str = "id, clinic_id, patient_id, nurse_id, doctor_id, status, queue_status,
    queue_position, priority, chief_complaint, diagnosis, medications, follow_up_instructions,
    tests_ordered, visit_date, checked_in_at, consent_at, finalized_at, error_message, error_at,
    failed_stage, created_at, updated_at";

/// Insert a freshly checked-in visit and assign its queue position in the
/// same statement: the number of visits already waiting that day, plus one.
pub fn insert_checked_in(conn: &Connection, visit: &Visit) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO visits (id, clinic_id, patient_id, status, queue_status, queue_position,
         priority, chief_complaint, visit_date, checked_in_at, created_at, updated_at)
         SELECT ?1, ?2, ?3, ?4, 'waiting',
                (SELECT COUNT(*) FROM visits
                 WHERE clinic_id = ?2 AND visit_date = ?7 AND queue_status = 'waiting') + 1,
                ?5, ?6, ?7, ?8, ?8, ?8",
        params![
            visit.id.to_string(),
            visit.clinic_id.to_string(),
            visit.patient_id.to_string(),
            visit.status.as_str(),
            visit.priority.as_str(),
            visit.chief_complaint,
            visit.visit_date.to_string(),
            ts(visit.checked_in_at),
        ],
    )?;

    let position = conn.query_row(
        "SELECT queue_position FROM visits WHERE id = ?1",
        params![visit.id.to_string()],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(position)
}

pub fn get_visit(conn: &Connection, id: Uuid) -> Result<Option<Visit>, StoreError> {
    let sql = format!("SELECT {VISIT_COLUMNS} FROM visits WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], |row| Ok(visit_from_row(row)))
        .optional()?
        .transpose()
}

/// Visits of one clinic-day whose queue status is in `statuses`
pub fn list_for_day(
    conn: &Connection,
    clinic_id: Uuid,
    day: NaiveDate,
    statuses: &[QueueStatus],
) -> Result<Vec<Visit>, StoreError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {VISIT_COLUMNS} FROM visits
         WHERE clinic_id = ?1 AND visit_date = ?2 AND queue_status IN ({})
         ORDER BY checked_in_at",
        placeholders(2, statuses.len())
    );

    let mut values = vec![clinic_id.to_string(), day.to_string()];
    values.extend(statuses.iter().map(|s| s.as_str().to_string()));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| Ok(visit_from_row(row)))?;

    let mut visits = Vec::new();
    for row in rows {
        visits.push(row??);
    }
    Ok(visits)
}

/// Per-status visit counts for one clinic-day
pub fn count_by_queue_status(
    conn: &Connection,
    clinic_id: Uuid,
    day: NaiveDate,
) -> Result<Vec<(QueueStatus, i64)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT queue_status, COUNT(*) FROM visits
         WHERE clinic_id = ?1 AND visit_date = ?2 GROUP BY queue_status",
    )?;
    let rows = stmt.query_map(params![clinic_id.to_string(), day.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = Vec::new();
    for row in rows {
        let (status, count) = row?;
        counts.push((parse_enum(&status)?, count));
    }
    Ok(counts)
}

/// Most recent visit of a patient that reached the patient (`Sent` or later)
pub fn latest_notified_for_patient(
    conn: &Connection,
    patient_id: Uuid,
) -> Result<Option<Visit>, StoreError> {
    let sql = format!(
        "SELECT {VISIT_COLUMNS} FROM visits
         WHERE patient_id = ?1 AND status IN ('sent', 'completed') AND finalized_at IS NOT NULL
         ORDER BY finalized_at DESC LIMIT 1"
    );
    conn.query_row(&sql, params![patient_id.to_string()], |row| {
        Ok(visit_from_row(row))
    })
    .optional()?
    .transpose()
}

/// A conditional queue transition
#[derive(Debug, Clone)]
pub struct QueueUpdate<'a> {
    pub visit_id: Uuid,
    pub clinic_id: Uuid,
    /// Legal source states
    pub from: &'a [QueueStatus],
    pub to: QueueStatus,
    pub nurse_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    /// Only succeed if this nurse is the assigned one
    pub require_nurse: Option<Uuid>,
    /// Only succeed if processing status is one of these (empty = any)
    pub require_processing: &'a [ProcessingStatus],
    pub at: DateTime<Utc>,
}

/// Apply a queue transition; `false` means the condition did not hold
pub fn update_queue_status(conn: &Connection, update: &QueueUpdate<'_>) -> Result<bool, StoreError> {
    if update.from.is_empty() {
        return Ok(false);
    }

    let mut sql = format!(
        "UPDATE visits SET queue_status = ?1, updated_at = ?2,
         nurse_id = COALESCE(?3, nurse_id), doctor_id = COALESCE(?4, doctor_id)
         WHERE id = ?5 AND clinic_id = ?6 AND (?7 IS NULL OR nurse_id = ?7)
         AND queue_status IN ({})",
        placeholders(7, update.from.len())
    );

    let mut values: Vec<Option<String>> = vec![
        Some(update.to.as_str().to_string()),
        Some(ts(update.at)),
        update.nurse_id.map(|id| id.to_string()),
        update.doctor_id.map(|id| id.to_string()),
        Some(update.visit_id.to_string()),
        Some(update.clinic_id.to_string()),
        update.require_nurse.map(|id| id.to_string()),
    ];
    values.extend(update.from.iter().map(|s| Some(s.as_str().to_string())));

    if !update.require_processing.is_empty() {
        sql.push_str(&format!(
            " AND status IN ({})",
            placeholders(values.len(), update.require_processing.len())
        ));
        values.extend(
            update
                .require_processing
                .iter()
                .map(|s| Some(s.as_str().to_string())),
        );
    }

    let affected = conn.execute(&sql, params_from_iter(values))?;
    Ok(affected == 1)
}

pub fn update_priority(
    conn: &Connection,
    visit_id: Uuid,
    clinic_id: Uuid,
    priority: Priority,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE visits SET priority = ?1, updated_at = ?2
         WHERE id = ?3 AND clinic_id = ?4 AND queue_status NOT IN ('completed', 'cancelled')",
        params![
            priority.as_str(),
            ts(at),
            visit_id.to_string(),
            clinic_id.to_string()
        ],
    )?;
    Ok(affected == 1)
}

pub fn update_chief_complaint(
    conn: &Connection,
    visit_id: Uuid,
    clinic_id: Uuid,
    chief_complaint: Option<&str>,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE visits SET chief_complaint = ?1, updated_at = ?2
         WHERE id = ?3 AND clinic_id = ?4 AND queue_status NOT IN ('completed', 'cancelled')",
        params![
            chief_complaint,
            ts(at),
            visit_id.to_string(),
            clinic_id.to_string()
        ],
    )?;
    Ok(affected == 1)
}

pub fn update_clinical_fields(
    conn: &Connection,
    visit_id: Uuid,
    fields: &ClinicalFields,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE visits SET diagnosis = ?1, medications = ?2, follow_up_instructions = ?3,
         tests_ordered = ?4, updated_at = ?5 WHERE id = ?6",
        params![
            fields.diagnosis,
            fields.medications,
            fields.follow_up_instructions,
            fields.tests_ordered,
            ts(at),
            visit_id.to_string(),
        ],
    )?;
    Ok(affected == 1)
}

/// Stamp consent once; later calls keep the first timestamp
pub fn record_consent(conn: &Connection, visit_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE visits SET consent_at = COALESCE(consent_at, ?1), updated_at = ?1 WHERE id = ?2",
        params![ts(at), visit_id.to_string()],
    )?;
    Ok(affected == 1)
}

/// Compare-and-set on processing status
pub fn transition_processing(
    conn: &Connection,
    visit_id: Uuid,
    from: &[ProcessingStatus],
    to: ProcessingStatus,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    if from.is_empty() {
        return Ok(false);
    }

    let sql = format!(
        "UPDATE visits SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
        placeholders(3, from.len())
    );
    let mut values = vec![to.as_str().to_string(), ts(at), visit_id.to_string()];
    values.extend(from.iter().map(|s| s.as_str().to_string()));

    let affected = conn.execute(&sql, params_from_iter(values))?;
    Ok(affected == 1)
}

/// Move a non-terminal visit to `Error`, recording which stage failed
pub fn mark_failed(
    conn: &Connection,
    visit_id: Uuid,
    stage: Stage,
    message: &str,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE visits SET status = 'error', failed_stage = ?1, error_message = ?2,
         error_at = ?3, updated_at = ?3
         WHERE id = ?4 AND status NOT IN ('completed', 'error')",
        params![stage.as_str(), message, ts(at), visit_id.to_string()],
    )?;
    Ok(affected == 1)
}

/// Leave `Error` for `to`, clearing the failure fields
pub fn clear_failure(
    conn: &Connection,
    visit_id: Uuid,
    to: ProcessingStatus,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE visits SET status = ?1, failed_stage = NULL, error_message = NULL,
         error_at = NULL, updated_at = ?2
         WHERE id = ?3 AND status = 'error'",
        params![to.as_str(), ts(at), visit_id.to_string()],
    )?;
    Ok(affected == 1)
}

/// `Review | Sent -> Sent`, stamping `finalized_at`
pub fn mark_sent(conn: &Connection, visit_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE visits SET status = 'sent', finalized_at = ?1, updated_at = ?1
         WHERE id = ?2 AND status IN ('review', 'sent')",
        params![ts(at), visit_id.to_string()],
    )?;
    Ok(affected == 1)
}

fn visit_from_row(row: &Row<'_>) -> Result<Visit, StoreError> {
    let id: String = row.get(0)?;
    let clinic_id: String = row.get(1)?;
    let patient_id: String = row.get(2)?;
    let status: String = row.get(5)?;
    let queue_status: String = row.get(6)?;
    let priority: String = row.get(8)?;
    let visit_date: String = row.get(14)?;
    let checked_in_at: String = row.get(15)?;
    let failed_stage: Option<String> = row.get(20)?;
    let created_at: String = row.get(21)?;
    let updated_at: String = row.get(22)?;

    Ok(Visit {
        id: parse_uuid("visit id", &id)?,
        clinic_id: parse_uuid("visit clinic_id", &clinic_id)?,
        patient_id: parse_uuid("visit patient_id", &patient_id)?,
        nurse_id: parse_opt_uuid("visit nurse_id", row.get(3)?)?,
        doctor_id: parse_opt_uuid("visit doctor_id", row.get(4)?)?,
        status: parse_enum(&status)?,
        queue_status: parse_enum(&queue_status)?,
        queue_position: row.get(7)?,
        priority: parse_enum(&priority)?,
        chief_complaint: row.get(9)?,
        clinical: ClinicalFields {
            diagnosis: row.get(10)?,
            medications: row.get(11)?,
            follow_up_instructions: row.get(12)?,
            tests_ordered: row.get(13)?,
        },
        visit_date: parse_date("visit_date", &visit_date)?,
        checked_in_at: parse_ts("checked_in_at", &checked_in_at)?,
        consent_at: parse_opt_ts("consent_at", row.get(16)?)?,
        finalized_at: parse_opt_ts("finalized_at", row.get(17)?)?,
        error_message: row.get(18)?,
        error_at: parse_opt_ts("error_at", row.get(19)?)?,
        failed_stage: failed_stage.as_deref().map(parse_enum).transpose()?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}
