//! Clinics, staff and patients.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_enum, parse_uuid, ts, StoreError};
use crate::domain::{Clinic, Patient, Staff};

pub fn insert_clinic(conn: &Connection, clinic: &Clinic) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO clinics (id, name, utc_offset_minutes, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            clinic.id.to_string(),
            clinic.name,
            clinic.utc_offset_minutes,
            ts(Utc::now()),
        ],
    )?;
    Ok(())
}

pub fn get_clinic(conn: &Connection, id: Uuid) -> Result<Option<Clinic>, StoreError> {
    conn.query_row(
        "SELECT id, name, utc_offset_minutes FROM clinics WHERE id = ?1",
        params![id.to_string()],
        |row| Ok(clinic_from_row(row)),
    )
    .optional()?
    .transpose()
}

pub fn list_clinics(conn: &Connection) -> Result<Vec<Clinic>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, name, utc_offset_minutes FROM clinics ORDER BY name")?;
    let rows = stmt.query_map([], |row| Ok(clinic_from_row(row)))?;

    let mut clinics = Vec::new();
    for row in rows {
        clinics.push(row??);
    }
    Ok(clinics)
}

fn clinic_from_row(row: &Row<'_>) -> Result<Clinic, StoreError> {
    let id: String = row.get(0)?;
    Ok(Clinic {
        id: parse_uuid("clinic id", &id)?,
        name: row.get(1)?,
        utc_offset_minutes: row.get(2)?,
    })
}

pub fn insert_staff(conn: &Connection, staff: &Staff) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO staff (id, clinic_id, display_name, role, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            staff.id.to_string(),
            staff.clinic_id.to_string(),
            staff.display_name,
            staff.role.as_str(),
            staff.is_active as i32,
            ts(Utc::now()),
        ],
    )?;
    Ok(())
}

pub fn get_staff(conn: &Connection, id: Uuid) -> Result<Option<Staff>, StoreError> {
    conn.query_row(
        "SELECT id, clinic_id, display_name, role, is_active FROM staff WHERE id = ?1",
        params![id.to_string()],
        |row| Ok(staff_from_row(row)),
    )
    .optional()?
    .transpose()
}

pub fn list_staff(conn: &Connection, clinic_id: Uuid) -> Result<Vec<Staff>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, clinic_id, display_name, role, is_active FROM staff
         WHERE clinic_id = ?1 ORDER BY display_name",
    )?;
    let rows = stmt.query_map(params![clinic_id.to_string()], |row| Ok(staff_from_row(row)))?;

    let mut staff = Vec::new();
    for row in rows {
        staff.push(row??);
    }
    Ok(staff)
}

fn staff_from_row(row: &Row<'_>) -> Result<Staff, StoreError> {
    let id: String = row.get(0)?;
    let clinic_id: String = row.get(1)?;
    let role: String = row.get(3)?;
    let is_active: i32 = row.get(4)?;
    Ok(Staff {
        id: parse_uuid("staff id", &id)?,
        clinic_id: parse_uuid("staff clinic_id", &clinic_id)?,
        display_name: row.get(2)?,
        role: parse_enum(&role)?,
        is_active: is_active != 0,
    })
}

/// Insert a patient, or return the existing one with the same number at the clinic
pub fn register_patient(conn: &Connection, patient: &Patient) -> Result<Patient, StoreError> {
    conn.execute(
        "INSERT INTO patients (id, clinic_id, whatsapp_number, display_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (clinic_id, whatsapp_number) DO NOTHING",
        params![
            patient.id.to_string(),
            patient.clinic_id.to_string(),
            patient.whatsapp_number,
            patient.display_name,
            ts(Utc::now()),
        ],
    )?;

    find_patient_by_phone(conn, patient.clinic_id, &patient.whatsapp_number)?.ok_or_else(|| {
        StoreError::Corrupt {
            field: "patient",
            value: patient.whatsapp_number.clone(),
        }
    })
}

pub fn get_patient(conn: &Connection, id: Uuid) -> Result<Option<Patient>, StoreError> {
    conn.query_row(
        "SELECT id, clinic_id, whatsapp_number, display_name FROM patients WHERE id = ?1",
        params![id.to_string()],
        |row| Ok(patient_from_row(row)),
    )
    .optional()?
    .transpose()
}

pub fn find_patient_by_phone(
    conn: &Connection,
    clinic_id: Uuid,
    whatsapp_number: &str,
) -> Result<Option<Patient>, StoreError> {
    conn.query_row(
        "SELECT id, clinic_id, whatsapp_number, display_name FROM patients
         WHERE clinic_id = ?1 AND whatsapp_number = ?2",
        params![clinic_id.to_string(), whatsapp_number],
        |row| Ok(patient_from_row(row)),
    )
    .optional()?
    .transpose()
}

/// Every patient record for a number, across clinics
pub fn find_patients_by_phone(
    conn: &Connection,
    whatsapp_number: &str,
) -> Result<Vec<Patient>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, clinic_id, whatsapp_number, display_name FROM patients
         WHERE whatsapp_number = ?1",
    )?;
    let rows = stmt.query_map(params![whatsapp_number], |row| Ok(patient_from_row(row)))?;

    let mut patients = Vec::new();
    for row in rows {
        patients.push(row??);
    }
    Ok(patients)
}

fn patient_from_row(row: &Row<'_>) -> Result<Patient, StoreError> {
    let id: String = row.get(0)?;
    let clinic_id: String = row.get(1)?;
    Ok(Patient {
        id: parse_uuid("patient id", &id)?,
        clinic_id: parse_uuid("patient clinic_id", &clinic_id)?,
        whatsapp_number: row.get(2)?,
        display_name: row.get(3)?,
    })
}
