//! Stage 3: note generation, plus the doctor's review edits.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{require_role, VisitPipeline};
use crate::adapters::GenerationRequest;
use crate::core::EngineError;
use crate::domain::{
    ClinicalFields, NoteStatus, ProcessingEvent, ProcessingStatus, Role, Stage, StaffIdentity,
    Visit,
};
use crate::store::{directory, notes, visits};

const PROVIDER_SYSTEM: &str =
    "You are a medical scribe assistant helping doctors document patient visits.";
const PATIENT_SYSTEM: &str =
    "You are a friendly healthcare assistant helping patients understand their visit.";

const REVIEWERS: &[Role] = &[Role::Doctor, Role::Admin];

/// Both drafts produced for a visit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedNotes {
    pub provider: String,
    pub patient: String,
}

fn provider_prompt(transcript: &str, context: &[String]) -> String {
    let context = if context.is_empty() {
        String::new()
    } else {
        format!("\n\nAdditional context from doctor:\n{}", context.join("\n"))
    };

    format!(
        "You are a medical scribe. Generate a professional clinical note in SOAP format from this visit transcript.

Transcript:
{transcript}
{context}

Generate a structured clinical note with these sections:
- Subjective: Patient's reported symptoms and history
- Objective: Any vitals, observations, or exam findings mentioned
- Assessment: Clinical assessment and diagnosis
- Plan: Treatment plan, medications, follow-up

Be concise but thorough. Use medical terminology appropriately. If information is not mentioned in the transcript, note it as \"Not documented\" rather than making assumptions."
    )
}

fn patient_prompt(provider_note: &str, patient_name: Option<&str>) -> String {
    let name = patient_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("there");

    format!(
        "You are helping explain a doctor visit to a patient in simple, friendly language. Based on this clinical note, create a patient-friendly summary.

Clinical Note:
{provider_note}

Create a summary for the patient that includes:
1. A brief, friendly greeting using their name: {name}
2. What was found during the visit (in simple terms)
3. Any medications prescribed and how to take them
4. What to do next (follow-up appointments, tests, etc.)
5. When to seek help if things get worse

Use simple language a non-medical person can understand. Be warm and reassuring. Avoid medical jargon. Keep it under 300 words."
    )
}

impl VisitPipeline {
    /// Produce the clinician note and the patient note from the transcript.
    ///
    /// Both generations must succeed before anything is saved. Notes already
    /// in review are returned as they are.
    #[instrument(skip(self), fields(visit_id = %visit_id))]
    pub async fn generate_notes(&self, visit_id: Uuid) -> Result<GeneratedNotes, EngineError> {
        let visit = self.visit(visit_id)?;

        if visit.status.has_reached(ProcessingStatus::Review) {
            return self.stored_notes(visit_id);
        }
        if visit.status != ProcessingStatus::Processing {
            return Err(EngineError::validation(format!(
                "visit is {}, notes are generated while processing",
                visit.status
            )));
        }

        let transcript = self
            .store
            .with_conn(|conn| notes::get_provider_note(conn, visit_id))?
            .and_then(|note| note.transcript)
            .ok_or_else(|| EngineError::validation("Transcript not found"))?;

        let patient_name = self
            .store
            .with_conn(|conn| directory::get_patient(conn, visit.patient_id))?
            .and_then(|p| p.display_name);

        let generated = match self
            .run_generation(&transcript, &visit, patient_name.as_deref())
            .await
        {
            Ok(notes) => notes,
            Err(e) => return Err(self.fail_stage(visit_id, Stage::GenerateNotes, &e)),
        };

        let to = visit.status.transition(ProcessingEvent::NotesReady)?;
        let now = Utc::now();
        let language = self.config.language.clone();

        let saved: Result<(), EngineError> = self.store.with_tx(|tx| {
            notes::save_provider_content(tx, visit_id, &generated.provider, now)?;
            notes::save_patient_content(tx, visit_id, &generated.patient, &language, now)?;
            let moved = visits::transition_processing(
                tx,
                visit_id,
                &[ProcessingStatus::Processing],
                to,
                now,
            )?;
            if moved {
                Ok(())
            } else {
                Err(EngineError::Conflict {
                    entity: "visit",
                    id: visit_id,
                    message: "left processing while notes were generated".to_string(),
                })
            }
        });

        match saved {
            Ok(()) => {}
            Err(e @ EngineError::Conflict { .. }) => return Err(e),
            Err(e) => return Err(self.fail_stage(visit_id, Stage::GenerateNotes, &e)),
        }

        info!(
            provider_chars = generated.provider.len(),
            patient_chars = generated.patient.len(),
            "Notes ready for review"
        );
        Ok(generated)
    }

    async fn run_generation(
        &self,
        transcript: &str,
        visit: &Visit,
        patient_name: Option<&str>,
    ) -> Result<GeneratedNotes, EngineError> {
        let generator = &self.services.generator;

        let provider_request = GenerationRequest {
            system: PROVIDER_SYSTEM.to_string(),
            prompt: provider_prompt(transcript, &visit.clinical.context_lines()),
            temperature: 0.3,
            max_tokens: 2000,
        };
        let request = &provider_request;
        let provider = self
            .retry
            .execute("generate provider note", || async move {
                generator.generate(request).await
            })
            .await?;

        let patient_request = GenerationRequest {
            system: PATIENT_SYSTEM.to_string(),
            prompt: patient_prompt(&provider.content, patient_name),
            temperature: 0.5,
            max_tokens: 1000,
        };
        let request = &patient_request;
        let patient = self
            .retry
            .execute("generate patient note", || async move {
                generator.generate(request).await
            })
            .await?;

        Ok(GeneratedNotes {
            provider: provider.content,
            patient: patient.content,
        })
    }

    fn stored_notes(&self, visit_id: Uuid) -> Result<GeneratedNotes, EngineError> {
        let (provider, patient) = self.store.with_conn(|conn| {
            Ok::<_, EngineError>((
                notes::get_provider_note(conn, visit_id)?.and_then(|n| n.content),
                notes::get_patient_note(conn, visit_id)?.and_then(|n| n.content),
            ))
        })?;

        match (provider, patient) {
            (Some(provider), Some(patient)) => Ok(GeneratedNotes { provider, patient }),
            _ => Err(EngineError::not_found("notes", visit_id)),
        }
    }

    /// Transcribe then generate; generation never runs after a failed transcription
    pub async fn process_recording(&self, visit_id: Uuid) -> Result<GeneratedNotes, EngineError> {
        self.transcribe(visit_id).await?;
        self.generate_notes(visit_id).await
    }

    pub fn update_provider_note(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
        content: &str,
    ) -> Result<(), EngineError> {
        require_role(actor, REVIEWERS, "edit notes")?;
        self.visit_for(actor, visit_id)?;
        let edited = self.store.with_conn(|conn| {
            notes::edit_provider_content(conn, visit_id, content, Utc::now())
        })?;
        if edited {
            return Ok(());
        }
        let status = self
            .store
            .with_conn(|conn| notes::get_provider_note(conn, visit_id))?
            .map(|n| n.status);
        Err(not_editable("provider note", visit_id, status))
    }

    pub fn update_patient_note(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
        content: &str,
    ) -> Result<(), EngineError> {
        require_role(actor, REVIEWERS, "edit notes")?;
        self.visit_for(actor, visit_id)?;
        let edited = self.store.with_conn(|conn| {
            notes::edit_patient_content(conn, visit_id, content, Utc::now())
        })?;
        if edited {
            return Ok(());
        }
        let status = self
            .store
            .with_conn(|conn| notes::get_patient_note(conn, visit_id))?
            .map(|n| n.status);
        Err(not_editable("patient note", visit_id, status))
    }

    /// Replace the structured clinical fields used as generation context
    pub fn update_clinical_fields(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
        fields: &ClinicalFields,
    ) -> Result<Visit, EngineError> {
        require_role(actor, REVIEWERS, "edit clinical fields")?;
        self.visit_for(actor, visit_id)?;
        self.store.with_conn(|conn| {
            visits::update_clinical_fields(conn, visit_id, fields, Utc::now())
        })?;
        self.visit(visit_id)
    }
}

fn not_editable(entity: &'static str, visit_id: Uuid, status: Option<NoteStatus>) -> EngineError {
    match status {
        Some(NoteStatus::Finalized) => EngineError::validation(format!(
            "{} is finalized and can no longer be edited",
            entity
        )),
        _ => EngineError::not_found(entity, visit_id),
    }
}
