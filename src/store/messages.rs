//! Notification attempt log.

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::{opt_ts, parse_enum, parse_opt_ts, parse_ts, parse_uuid, ts, StoreError};
use crate::domain::MessageLog;

pub fn insert_message_log(conn: &Connection, log: &MessageLog) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO message_logs (id, patient_id, visit_id, channel, message_type, variant,
         status, external_id, error_message, sent_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            log.id.to_string(),
            log.patient_id.to_string(),
            log.visit_id.to_string(),
            log.channel,
            log.message_type,
            log.variant.as_str(),
            log.status.as_str(),
            log.external_id,
            log.error_message,
            opt_ts(log.sent_at),
            ts(log.created_at),
        ],
    )?;
    Ok(())
}

pub fn list_for_visit(conn: &Connection, visit_id: Uuid) -> Result<Vec<MessageLog>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, visit_id, channel, message_type, variant, status, external_id,
         error_message, sent_at, created_at FROM message_logs
         WHERE visit_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![visit_id.to_string()], |row| Ok(log_from_row(row)))?;

    let mut logs = Vec::new();
    for row in rows {
        logs.push(row??);
    }
    Ok(logs)
}

fn log_from_row(row: &Row<'_>) -> Result<MessageLog, StoreError> {
    let id: String = row.get(0)?;
    let patient_id: String = row.get(1)?;
    let visit_id: String = row.get(2)?;
    let variant: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(10)?;

    Ok(MessageLog {
        id: parse_uuid("message id", &id)?,
        patient_id: parse_uuid("message patient_id", &patient_id)?,
        visit_id: parse_uuid("message visit_id", &visit_id)?,
        channel: row.get(3)?,
        message_type: row.get(4)?,
        variant: parse_enum(&variant)?,
        status: parse_enum(&status)?,
        external_id: row.get(7)?,
        error_message: row.get(8)?,
        sent_at: parse_opt_ts("sent_at", row.get(9)?)?,
        created_at: parse_ts("created_at", &created_at)?,
    })
}
