//! Magic links for patient access.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{opt_ts, parse_opt_ts, parse_ts, parse_uuid, ts, StoreError};
use crate::domain::MagicLink;

pub fn insert_link(conn: &Connection, link: &MagicLink) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO magic_links (id, patient_id, visit_id, token, expires_at, first_accessed_at,
         created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            link.id.to_string(),
            link.patient_id.to_string(),
            link.visit_id.to_string(),
            link.token,
            ts(link.expires_at),
            opt_ts(link.first_accessed_at),
            ts(link.created_at),
        ],
    )?;
    Ok(())
}

/// Expire every still-live link of a visit; returns how many were cut short
pub fn invalidate_live_links(
    conn: &Connection,
    visit_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let now = ts(now);
    let affected = conn.execute(
        "UPDATE magic_links SET expires_at = ?1 WHERE visit_id = ?2 AND expires_at > ?1",
        params![now, visit_id.to_string()],
    )?;
    Ok(affected)
}

pub fn get_link_by_token(conn: &Connection, token: &str) -> Result<Option<MagicLink>, StoreError> {
    conn.query_row(
        "SELECT id, patient_id, visit_id, token, expires_at, first_accessed_at, created_at
         FROM magic_links WHERE token = ?1",
        params![token],
        |row| Ok(link_from_row(row)),
    )
    .optional()?
    .transpose()
}

/// Stamp first access; `true` only for the call that set it
pub fn mark_first_access(
    conn: &Connection,
    link_id: Uuid,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE magic_links SET first_accessed_at = ?1
         WHERE id = ?2 AND first_accessed_at IS NULL",
        params![ts(at), link_id.to_string()],
    )?;
    Ok(affected == 1)
}

pub fn list_links_for_visit(conn: &Connection, visit_id: Uuid) -> Result<Vec<MagicLink>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, visit_id, token, expires_at, first_accessed_at, created_at
         FROM magic_links WHERE visit_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![visit_id.to_string()], |row| Ok(link_from_row(row)))?;

    let mut links = Vec::new();
    for row in rows {
        links.push(row??);
    }
    Ok(links)
}

fn link_from_row(row: &Row<'_>) -> Result<MagicLink, StoreError> {
    let id: String = row.get(0)?;
    let patient_id: String = row.get(1)?;
    let visit_id: String = row.get(2)?;
    let expires_at: String = row.get(4)?;
    let created_at: String = row.get(6)?;

    Ok(MagicLink {
        id: parse_uuid("link id", &id)?,
        patient_id: parse_uuid("link patient_id", &patient_id)?,
        visit_id: parse_uuid("link visit_id", &visit_id)?,
        token: row.get(3)?,
        expires_at: parse_ts("expires_at", &expires_at)?,
        first_accessed_at: parse_opt_ts("first_accessed_at", row.get(5)?)?,
        created_at: parse_ts("created_at", &created_at)?,
    })
}
