//! Stage 4: approval, magic link and patient notification.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{require_role, VisitPipeline};
use crate::adapters::{MessageReceipt, TemplateMessage};
use crate::core::EngineError;
use crate::domain::{
    MagicLink, MessageLog, MessageStatus, MessageVariant, ProcessingEvent, Role, StaffIdentity,
    Visit,
};
use crate::store::{directory, links, messages, notes, visits, StoreError};

const MESSAGE_TYPE: &str = "patient_note";

/// A freshly issued link and how the patient was told about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeOutcome {
    pub link: MagicLink,
    pub note_url: String,
    pub message: MessageLog,
}

/// Expire the visit's live links and mint the replacement
pub(super) fn replace_link(
    conn: &Connection,
    visit: &Visit,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<MagicLink, StoreError> {
    let invalidated = links::invalidate_live_links(conn, visit.id, now)?;
    let link = MagicLink::issue(visit.patient_id, visit.id, ttl, now);
    links::insert_link(conn, &link)?;
    if invalidated > 0 {
        info!(visit_id = %visit.id, invalidated, "Replaced live magic link");
    }
    Ok(link)
}

impl VisitPipeline {
    /// Approve the reviewed notes and send them to the patient.
    ///
    /// Finalizing again from `Sent` reissues the link. Notification problems
    /// are recorded in the message log and never undo the approval.
    #[instrument(skip(self, actor), fields(visit_id = %visit_id, actor = %actor.staff_id))]
    pub async fn finalize(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
    ) -> Result<FinalizeOutcome, EngineError> {
        require_role(actor, &[Role::Doctor, Role::Admin], "finalize notes")?;
        let visit = self.visit_for(actor, visit_id)?;
        visit.status.transition(ProcessingEvent::Finalize)?;

        let ttl = Duration::days(self.config.magic_link_expiry_days);
        let now = Utc::now();

        let link = self.store.with_tx(|tx| {
            let has_notes = notes::get_provider_note(tx, visit_id)?
                .and_then(|n| n.content)
                .is_some()
                && notes::get_patient_note(tx, visit_id)?
                    .and_then(|n| n.content)
                    .is_some();
            if !has_notes {
                return Err(EngineError::validation("notes have not been generated"));
            }

            let link = replace_link(tx, &visit, ttl, now)?;
            notes::finalize_notes(tx, visit_id, actor.staff_id, now)?;

            if !visits::mark_sent(tx, visit_id, now)? {
                return Err(EngineError::Conflict {
                    entity: "visit",
                    id: visit_id,
                    message: "was no longer in review".to_string(),
                });
            }
            Ok(link)
        })?;

        info!(expires_at = %link.expires_at, "Notes finalized");

        let message = self.notify_patient(&visit, &link).await;
        Ok(FinalizeOutcome {
            note_url: self.config.note_url(&link.token),
            link,
            message,
        })
    }

    /// Tell the patient about a link: template first, plain text as fallback.
    ///
    /// The outcome is always written to the message log.
    pub(super) async fn notify_patient(&self, visit: &Visit, link: &MagicLink) -> MessageLog {
        let notifier = &self.services.notifier;

        let (variant, result) = match self.recipient(visit) {
            Ok((phone, clinic_name)) => {
                let template = TemplateMessage {
                    to: phone.clone(),
                    template: self.config.notification_template.clone(),
                    language: self.config.language.clone(),
                    body_params: vec![clinic_name.clone()],
                    button_param: Some(link.token.clone()),
                };
                let message = &template;
                let sent = self
                    .retry
                    .execute("send template notification", || async move {
                        notifier.send_template(message).await
                    })
                    .await;

                match sent {
                    Ok(receipt) => (MessageVariant::Template, Ok(receipt)),
                    Err(e) => {
                        warn!(visit_id = %visit.id, error = %e, "Template message failed, falling back to text");
                        let body = self.fallback_text(&clinic_name, &link.token);
                        let (to, body) = (phone.as_str(), body.as_str());
                        let sent = self
                            .retry
                            .execute("send text notification", || async move {
                                notifier.send_text(to, body).await
                            })
                            .await;
                        (MessageVariant::Text, sent)
                    }
                }
            }
            Err(e) => (MessageVariant::Template, Err(e)),
        };

        let log = message_log(visit, notifier.channel(), variant, result);
        match log.status {
            MessageStatus::Sent => {
                info!(visit_id = %visit.id, variant = %log.variant, "Patient notified")
            }
            MessageStatus::Failed => warn!(
                visit_id = %visit.id,
                error = log.error_message.as_deref().unwrap_or(""),
                "Patient notification failed"
            ),
        }

        if let Err(e) = self
            .store
            .with_conn(|conn| messages::insert_message_log(conn, &log))
        {
            warn!(visit_id = %visit.id, error = %e, "Failed to write message log");
        }
        log
    }

    /// Patient number and clinic name for a visit
    fn recipient(&self, visit: &Visit) -> Result<(String, String), EngineError> {
        self.store.with_conn(|conn| {
            let patient = directory::get_patient(conn, visit.patient_id)?
                .ok_or_else(|| EngineError::not_found("patient", visit.patient_id))?;
            let clinic = directory::get_clinic(conn, visit.clinic_id)?
                .ok_or_else(|| EngineError::not_found("clinic", visit.clinic_id))?;
            Ok((patient.whatsapp_number, clinic.name))
        })
    }

    fn fallback_text(&self, clinic_name: &str, token: &str) -> String {
        format!(
            "Your visit summary from {} is ready.\n\nView your summary here:\n{}\n\nThis link will expire in {} days.",
            clinic_name,
            self.config.note_url(token),
            self.config.magic_link_expiry_days
        )
    }
}

fn message_log(
    visit: &Visit,
    channel: &str,
    variant: MessageVariant,
    result: Result<MessageReceipt, EngineError>,
) -> MessageLog {
    let now = Utc::now();
    let (status, external_id, error_message, sent_at) = match result {
        Ok(receipt) => (MessageStatus::Sent, receipt.external_id, None, Some(now)),
        Err(e) => (MessageStatus::Failed, None, Some(e.to_string()), None),
    };

    MessageLog {
        id: Uuid::new_v4(),
        patient_id: visit.patient_id,
        visit_id: visit.id,
        channel: channel.to_string(),
        message_type: MESSAGE_TYPE.to_string(),
        variant,
        status,
        external_id,
        error_message,
        sent_at,
        created_at: now,
    }
}
