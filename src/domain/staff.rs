//! Clinics, staff identities and patients.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Country code applied to local numbers
pub const DEFAULT_COUNTRY_CODE: &str = "+256";

str_enum!(Role {
    Admin => "admin",
    Doctor => "doctor",
    Nurse => "nurse",
});

/// The resolved `(staff, clinic, role)` triple supplied by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffIdentity {
    pub staff_id: Uuid,
    pub clinic_id: Uuid,
    pub role: Role,
}

impl StaffIdentity {
    pub fn new(staff_id: Uuid, clinic_id: Uuid, role: Role) -> Self {
        Self {
            staff_id,
            clinic_id,
            role,
        }
    }

    pub fn has_role(&self, roles: &[Role]) -> bool {
        roles.contains(&self.role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Staff {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub is_active: bool,
}

impl Staff {
    pub fn identity(&self) -> StaffIdentity {
        StaffIdentity::new(self.id, self.clinic_id, self.role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clinic {
    pub id: Uuid,
    pub name: String,

    /// Offset of clinic-local time from UTC, in minutes
    pub utc_offset_minutes: i32,
}

impl Clinic {
    /// Clinic-local calendar day for an instant
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        local_date(self.utc_offset_minutes, at)
    }
}

/// Calendar day at `at` for a fixed UTC offset (out-of-range offsets fall back to UTC)
pub fn local_date(utc_offset_minutes: i32, at: DateTime<Utc>) -> NaiveDate {
    match FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)) {
        Some(offset) => at.with_timezone(&offset).date_naive(),
        None => at.date_naive(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub clinic_id: Uuid,

    /// Normalised E.164 number used for notifications
    pub whatsapp_number: String,

    pub display_name: Option<String>,
}

/// Normalise a phone number: strip punctuation, expand local `0` prefix
pub fn format_phone_number(phone: &str) -> String {
    let mut cleaned: String = phone
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if let Some(rest) = cleaned.strip_prefix('0') {
        cleaned = format!("{}{}", DEFAULT_COUNTRY_CODE, rest);
    }

    if !cleaned.starts_with('+') {
        cleaned = format!("{}{}", DEFAULT_COUNTRY_CODE, cleaned);
    }

    cleaned
}

/// Whether a number normalises to `+256` followed by nine digits
pub fn is_valid_phone(phone: &str) -> bool {
    let formatted = format_phone_number(phone);
    match formatted.strip_prefix(DEFAULT_COUNTRY_CODE) {
        Some(rest) => rest.len() == 9 && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}
