//! Patient-side access through magic links.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::finalize::replace_link;
use super::{FinalizeOutcome, VisitPipeline};
use crate::core::EngineError;
use crate::domain::{
    format_phone_number, is_valid_phone, ClinicalFields, NoteStatus, ProcessingEvent,
    ProcessingStatus, Visit,
};
use crate::store::{directory, links, notes, visits};

/// What a patient sees behind their link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientNoteView {
    pub clinic_name: String,
    pub visit_date: NaiveDate,
    pub patient_name: Option<String>,
    pub content: String,
    #[serde(flatten)]
    pub clinical: ClinicalFields,
    pub expires_at: DateTime<Utc>,
}

impl VisitPipeline {
    /// Resolve a magic link to the finalized patient note.
    ///
    /// The first successful open moves the visit from `Sent` to `Completed`.
    #[instrument(skip_all)]
    pub fn open_patient_note(&self, token: &str) -> Result<PatientNoteView, EngineError> {
        let now = Utc::now();
        let link = self
            .store
            .with_conn(|conn| links::get_link_by_token(conn, token))?
            .ok_or_else(|| EngineError::not_found("magic link", "token"))?;

        if !link.is_live(now) {
            return Err(EngineError::validation(
                "This link has expired. Request a new one from your clinic.",
            ));
        }

        let visit = self.visit(link.visit_id)?;
        let note = self
            .store
            .with_conn(|conn| notes::get_patient_note(conn, visit.id))?
            .filter(|n| n.status == NoteStatus::Finalized)
            .ok_or_else(|| EngineError::not_found("patient note", visit.id))?;

        let first_open = self
            .store
            .with_conn(|conn| links::mark_first_access(conn, link.id, now))?;
        if first_open {
            let to = ProcessingStatus::Sent.transition(ProcessingEvent::PatientOpened)?;
            let completed = self.store.with_conn(|conn| {
                visits::transition_processing(conn, visit.id, &[ProcessingStatus::Sent], to, now)
            })?;
            info!(visit_id = %visit.id, completed, "Patient opened note");
        }

        let (clinic_name, patient_name) = self.store.with_conn(|conn| {
            let clinic = directory::get_clinic(conn, visit.clinic_id)?
                .ok_or_else(|| EngineError::not_found("clinic", visit.clinic_id))?;
            let patient = directory::get_patient(conn, visit.patient_id)?;
            Ok::<_, EngineError>((clinic.name, patient.and_then(|p| p.display_name)))
        })?;

        Ok(PatientNoteView {
            clinic_name,
            visit_date: visit.visit_date,
            patient_name,
            content: note.content.unwrap_or_default(),
            clinical: visit.clinical,
            expires_at: link.expires_at,
        })
    }

    /// Reissue the link for a patient's most recent notified visit
    #[instrument(skip_all)]
    pub async fn request_new_link(&self, phone: &str) -> Result<FinalizeOutcome, EngineError> {
        if !is_valid_phone(phone) {
            return Err(EngineError::validation("Invalid phone number"));
        }
        let phone = format_phone_number(phone);

        let visit = self
            .store
            .with_conn(|conn| {
                let mut latest: Option<Visit> = None;
                for patient in directory::find_patients_by_phone(conn, &phone)? {
                    if let Some(visit) = visits::latest_notified_for_patient(conn, patient.id)? {
                        if latest
                            .as_ref()
                            .map_or(true, |l| visit.finalized_at > l.finalized_at)
                        {
                            latest = Some(visit);
                        }
                    }
                }
                Ok::<_, EngineError>(latest)
            })?
            .ok_or_else(|| EngineError::not_found("notified visit", "phone"))?;

        let ttl = Duration::days(self.config.magic_link_expiry_days);
        let link = self
            .store
            .with_tx(|tx| replace_link(tx, &visit, ttl, Utc::now()))?;

        info!(visit_id = %visit.id, "Reissued magic link on request");

        let message = self.notify_patient(&visit, &link).await;
        Ok(FinalizeOutcome {
            note_url: self.config.note_url(&link.token),
            link,
            message,
        })
    }
}
