//! Queue coordination: check-in, claims and board reads.
//!
//! Every claim is a conditional update on the visit row. When the update
//! affects no row the engine re-reads the visit to tell the caller why:
//! gone, claimed by someone else, premature, or not theirs to make.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::feed::{QueueFeed, QueueSubscription};
use crate::core::EngineError;
use crate::domain::{
    ChangeKind, Clinic, Priority, ProcessingStatus, QueueChange, QueueEvent, QueueStatus, Role,
    StaffIdentity, TransitionError, Visit,
};
use crate::store::{directory, visits, Store};

/// Processing states at which a visit may leave the queue as completed
const COMPLETABLE: &[ProcessingStatus] = &[
    ProcessingStatus::Review,
    ProcessingStatus::Sent,
    ProcessingStatus::Completed,
];

/// Non-terminal queue states shown on the board
const ACTIVE: &[QueueStatus] = &[
    QueueStatus::Waiting,
    QueueStatus::WithNurse,
    QueueStatus::ReadyForDoctor,
    QueueStatus::WithDoctor,
];

/// Result of a check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckIn {
    pub visit_id: Uuid,
    pub queue_position: i64,
}

/// One row of the clinic board
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub visit: Visit,

    /// Only set while waiting
    pub wait_minutes: Option<i64>,
}

/// Board summary for a clinic-day
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub with_nurse: i64,
    pub ready_for_doctor: i64,
    pub with_doctor: i64,
    pub completed: i64,
    pub cancelled: i64,
    pub average_wait_minutes: Option<i64>,
    pub longest_wait_minutes: Option<i64>,
}

/// Extra conditions on a queue transition
#[derive(Debug, Default)]
struct Claim {
    nurse_id: Option<Uuid>,
    doctor_id: Option<Uuid>,
    require_nurse: Option<Uuid>,
    require_processing: &'static [ProcessingStatus],
}

/// Sole writer of queue status, position and staff assignment
#[derive(Debug, Clone)]
pub struct QueueEngine {
    store: Arc<Store>,
    feed: QueueFeed,
}

impl QueueEngine {
    pub fn new(store: Arc<Store>, feed: QueueFeed) -> Self {
        Self { store, feed }
    }

    pub fn feed(&self) -> &QueueFeed {
        &self.feed
    }

    /// Create a `Waiting` visit and give it the next ticket number
    pub fn check_in(
        &self,
        actor: &StaffIdentity,
        patient_id: Uuid,
        chief_complaint: Option<String>,
        priority: Priority,
    ) -> Result<CheckIn, EngineError> {
        let clinic = self.clinic(actor)?;
        let patient = self
            .store
            .with_conn(|conn| directory::get_patient(conn, patient_id))?
            .filter(|p| p.clinic_id == actor.clinic_id)
            .ok_or_else(|| EngineError::not_found("patient", patient_id))?;

        let chief_complaint = chief_complaint
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        let now = Utc::now();
        let visit = Visit {
            id: Uuid::new_v4(),
            clinic_id: clinic.id,
            patient_id: patient.id,
            nurse_id: None,
            doctor_id: None,
            status: ProcessingStatus::Recording,
            queue_status: QueueStatus::Waiting,
            queue_position: None,
            priority,
            chief_complaint,
            clinical: Default::default(),
            visit_date: clinic.local_date(now),
            checked_in_at: now,
            consent_at: None,
            finalized_at: None,
            error_message: None,
            error_at: None,
            failed_stage: None,
            created_at: now,
            updated_at: now,
        };

        let queue_position = self
            .store
            .with_conn(|conn| visits::insert_checked_in(conn, &visit))?;

        info!(
            visit_id = %visit.id,
            clinic_id = %clinic.id,
            queue_position,
            priority = %priority,
            "Patient checked in"
        );

        self.publish(
            actor,
            &visit,
            ChangeKind::CheckedIn { queue_position },
            QueueStatus::Waiting,
            now,
        );

        Ok(CheckIn {
            visit_id: visit.id,
            queue_position,
        })
    }

    /// `Waiting -> WithNurse`. A nurse may only assign themselves.
    pub fn assign_to_nurse(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
        nurse_id: Uuid,
    ) -> Result<Visit, EngineError> {
        require_role(actor, &[Role::Nurse, Role::Admin], "assign a nurse")?;

        if actor.role == Role::Nurse && nurse_id != actor.staff_id {
            return Err(EngineError::Forbidden {
                role: actor.role,
                operation: "assign another nurse",
            });
        }

        let nurse = self
            .store
            .with_conn(|conn| directory::get_staff(conn, nurse_id))?
            .filter(|s| s.clinic_id == actor.clinic_id)
            .ok_or_else(|| EngineError::not_found("staff", nurse_id))?;
        if nurse.role != Role::Nurse || !nurse.is_active {
            return Err(EngineError::validation(format!(
                "{} is not an active nurse",
                nurse.display_name
            )));
        }

        self.apply(
            actor,
            visit_id,
            QueueEvent::AssignNurse,
            Claim {
                nurse_id: Some(nurse_id),
                ..Default::default()
            },
        )
    }

    /// `WithNurse -> ReadyForDoctor`, only by the assigned nurse
    pub fn mark_ready_for_doctor(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
    ) -> Result<Visit, EngineError> {
        require_role(actor, &[Role::Nurse], "hand a patient to the doctor")?;

        self.apply(
            actor,
            visit_id,
            QueueEvent::ReadyForDoctor,
            Claim {
                require_nurse: Some(actor.staff_id),
                ..Default::default()
            },
        )
    }

    /// `ReadyForDoctor -> WithDoctor`, claimed by the acting doctor
    pub fn claim_patient(&self, actor: &StaffIdentity, visit_id: Uuid) -> Result<Visit, EngineError> {
        require_role(actor, &[Role::Doctor, Role::Admin], "claim a patient")?;

        self.apply(
            actor,
            visit_id,
            QueueEvent::ClaimByDoctor,
            Claim {
                doctor_id: Some(actor.staff_id),
                ..Default::default()
            },
        )
    }

    /// Any active state `-> Completed`, once notes have reached review
    pub fn complete_visit_queue(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
    ) -> Result<Visit, EngineError> {
        require_role(actor, &[Role::Doctor, Role::Admin], "complete a visit")?;

        self.apply(
            actor,
            visit_id,
            QueueEvent::Complete,
            Claim {
                require_processing: COMPLETABLE,
                ..Default::default()
            },
        )
    }

    /// Any active state `-> Cancelled`
    pub fn cancel_visit_queue(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
    ) -> Result<Visit, EngineError> {
        self.apply(actor, visit_id, QueueEvent::Cancel, Claim::default())
    }

    pub fn update_priority(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
        priority: Priority,
    ) -> Result<Visit, EngineError> {
        let now = Utc::now();
        let updated = self.store.with_conn(|conn| {
            visits::update_priority(conn, visit_id, actor.clinic_id, priority, now)
        })?;
        let visit = self.visit_for(actor, visit_id)?;

        if !updated {
            return Err(EngineError::Conflict {
                entity: "visit",
                id: visit_id,
                message: format!("is already {}", visit.queue_status),
            });
        }

        self.publish(
            actor,
            &visit,
            ChangeKind::PriorityChanged { priority },
            visit.queue_status,
            now,
        );
        Ok(visit)
    }

    pub fn update_chief_complaint(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
        chief_complaint: Option<&str>,
    ) -> Result<Visit, EngineError> {
        let chief_complaint = chief_complaint.map(str::trim).filter(|c| !c.is_empty());
        let now = Utc::now();
        let updated = self.store.with_conn(|conn| {
            visits::update_chief_complaint(conn, visit_id, actor.clinic_id, chief_complaint, now)
        })?;
        let visit = self.visit_for(actor, visit_id)?;

        if !updated {
            return Err(EngineError::Conflict {
                entity: "visit",
                id: visit_id,
                message: format!("is already {}", visit.queue_status),
            });
        }

        self.publish(actor, &visit, ChangeKind::DetailsUpdated, visit.queue_status, now);
        Ok(visit)
    }

    /// Active visits for a clinic-day (defaults to today, clinic-local).
    ///
    /// Ordered by stage, then priority (urgent first), then ticket number.
    pub fn get_clinic_queue(
        &self,
        actor: &StaffIdentity,
        day: Option<NaiveDate>,
    ) -> Result<Vec<QueueEntry>, EngineError> {
        let now = Utc::now();
        let day = self.day_or_today(actor, day, now)?;

        let mut visits = self
            .store
            .with_conn(|conn| visits::list_for_day(conn, actor.clinic_id, day, ACTIVE))?;

        visits.sort_by_key(|v| {
            (
                v.queue_status.board_order(),
                Reverse(v.priority.rank()),
                v.queue_position.unwrap_or(i64::MAX),
                v.checked_in_at,
            )
        });

        Ok(visits
            .into_iter()
            .map(|visit| QueueEntry {
                wait_minutes: visit.wait_minutes(now),
                visit,
            })
            .collect())
    }

    pub fn queue_stats(
        &self,
        actor: &StaffIdentity,
        day: Option<NaiveDate>,
    ) -> Result<QueueStats, EngineError> {
        let now = Utc::now();
        let day = self.day_or_today(actor, day, now)?;

        let counts = self
            .store
            .with_conn(|conn| visits::count_by_queue_status(conn, actor.clinic_id, day))?;

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            match status {
                QueueStatus::Waiting => stats.waiting = count,
                QueueStatus::WithNurse => stats.with_nurse = count,
                QueueStatus::ReadyForDoctor => stats.ready_for_doctor = count,
                QueueStatus::WithDoctor => stats.with_doctor = count,
                QueueStatus::Completed => stats.completed = count,
                QueueStatus::Cancelled => stats.cancelled = count,
            }
        }

        let waits: Vec<i64> = self
            .store
            .with_conn(|conn| {
                visits::list_for_day(conn, actor.clinic_id, day, &[QueueStatus::Waiting])
            })?
            .iter()
            .filter_map(|v| v.wait_minutes(now))
            .collect();

        if !waits.is_empty() {
            stats.average_wait_minutes = Some(waits.iter().sum::<i64>() / waits.len() as i64);
            stats.longest_wait_minutes = waits.iter().max().copied();
        }

        Ok(stats)
    }

    /// Live changes for the actor's clinic on `day` (defaults to today)
    pub fn subscribe(
        &self,
        actor: &StaffIdentity,
        day: Option<NaiveDate>,
    ) -> Result<QueueSubscription, EngineError> {
        let day = self.day_or_today(actor, day, Utc::now())?;
        Ok(self.feed.subscribe(actor.clinic_id, day))
    }

    /// Load a visit of the actor's clinic; other clinics' visits do not exist
    pub fn visit_for(&self, actor: &StaffIdentity, visit_id: Uuid) -> Result<Visit, EngineError> {
        self.store
            .with_conn(|conn| visits::get_visit(conn, visit_id))?
            .filter(|v| v.clinic_id == actor.clinic_id)
            .ok_or_else(|| EngineError::not_found("visit", visit_id))
    }

    fn clinic(&self, actor: &StaffIdentity) -> Result<Clinic, EngineError> {
        self.store
            .with_conn(|conn| directory::get_clinic(conn, actor.clinic_id))?
            .ok_or_else(|| EngineError::not_found("clinic", actor.clinic_id))
    }

    fn day_or_today(
        &self,
        actor: &StaffIdentity,
        day: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<NaiveDate, EngineError> {
        match day {
            Some(day) => Ok(day),
            None => Ok(self.clinic(actor)?.local_date(now)),
        }
    }

    fn apply(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
        event: QueueEvent,
        claim: Claim,
    ) -> Result<Visit, EngineError> {
        let before = self.visit_for(actor, visit_id)?;

        let sources = QueueStatus::legal_sources(event);
        let from: Vec<QueueStatus> = sources.iter().map(|(from, _)| *from).collect();
        let to = match sources.first() {
            Some((_, to)) => *to,
            None => {
                return Err(TransitionError {
                    from: before.queue_status.as_str(),
                    event: event.to_string(),
                }
                .into())
            }
        };

        let now = Utc::now();
        let update = visits::QueueUpdate {
            visit_id,
            clinic_id: actor.clinic_id,
            from: &from,
            to,
            nurse_id: claim.nurse_id,
            doctor_id: claim.doctor_id,
            require_nurse: claim.require_nurse,
            require_processing: claim.require_processing,
            at: now,
        };

        let won = self
            .store
            .with_conn(|conn| visits::update_queue_status(conn, &update))?;

        // Read after the write so the outcome reflects the committed row
        let after = self.visit_for(actor, visit_id)?;

        if !won {
            return Err(self.explain_rejection(actor, &after, event, &from, &claim));
        }

        info!(
            visit_id = %visit_id,
            event = %event,
            from = %before.queue_status,
            to = %to,
            actor = %actor.staff_id,
            "Queue transition"
        );

        self.publish(
            actor,
            &after,
            ChangeKind::Transitioned {
                from: before.queue_status,
                to,
            },
            to,
            now,
        );

        Ok(after)
    }

    fn explain_rejection(
        &self,
        actor: &StaffIdentity,
        current: &Visit,
        event: QueueEvent,
        sources: &[QueueStatus],
        claim: &Claim,
    ) -> EngineError {
        let status = current.queue_status;
        debug!(visit_id = %current.id, event = %event, status = %status, "Queue update rejected");

        if sources.contains(&status) {
            if let Some(nurse) = claim.require_nurse {
                if current.nurse_id != Some(nurse) {
                    return EngineError::Forbidden {
                        role: actor.role,
                        operation: "act on another nurse's patient",
                    };
                }
            }
            if !claim.require_processing.is_empty()
                && !claim.require_processing.contains(&current.status)
            {
                return EngineError::validation(format!(
                    "notes are not ready for review (processing status is {})",
                    current.status
                ));
            }
            return EngineError::Conflict {
                entity: "visit",
                id: current.id,
                message: "changed while the update was in flight".to_string(),
            };
        }

        if status.is_terminal() {
            return EngineError::Conflict {
                entity: "visit",
                id: current.id,
                message: format!("is already {}", status),
            };
        }

        let furthest_source = sources.iter().map(|s| s.board_order()).max().unwrap_or(0);
        if status.board_order() > furthest_source {
            let expected: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();
            EngineError::Conflict {
                entity: "visit",
                id: current.id,
                message: format!(
                    "is no longer in {} state (now {}): already claimed by someone else",
                    expected.join("/"),
                    status
                ),
            }
        } else {
            TransitionError {
                from: status.as_str(),
                event: event.to_string(),
            }
            .into()
        }
    }

    fn publish(
        &self,
        actor: &StaffIdentity,
        visit: &Visit,
        kind: ChangeKind,
        queue_status: QueueStatus,
        at: DateTime<Utc>,
    ) {
        self.feed.publish(QueueChange {
            clinic_id: visit.clinic_id,
            visit_id: visit.id,
            visit_date: visit.visit_date,
            kind,
            queue_status,
            actor_id: actor.staff_id,
            at,
        });
    }
}

fn require_role(
    actor: &StaffIdentity,
    roles: &[Role],
    operation: &'static str,
) -> Result<(), EngineError> {
    if actor.has_role(roles) {
        Ok(())
    } else {
        Err(EngineError::Forbidden {
            role: actor.role,
            operation,
        })
    }
}
