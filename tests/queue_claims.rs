//! Queue Coordination Integration Tests
//!
//! Check-in tickets, exclusive claims under concurrency, board ordering
//! and the change feed.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use karibu::core::{EngineError, ErrorClass};
use karibu::domain::{
    ChangeKind, Priority, ProcessingStatus, QueueStatus, Role, Staff, StaffIdentity,
};
use karibu::store::directory;
use uuid::Uuid;

use common::Harness;

#[test]
fn test_check_in_then_second_nurse_conflicts() {
    let h = Harness::new();

    let checked_in = h
        .queue
        .check_in(&h.nurse, h.patient.id, Some("Fever".to_string()), Priority::Urgent)
        .unwrap();
    assert_eq!(checked_in.queue_position, 1);

    let visit = h.queue.visit_for(&h.nurse, checked_in.visit_id).unwrap();
    assert_eq!(visit.queue_status, QueueStatus::Waiting);
    assert_eq!(visit.status, ProcessingStatus::Recording);
    assert_eq!(visit.priority, Priority::Urgent);

    let assigned = h
        .queue
        .assign_to_nurse(&h.nurse, checked_in.visit_id, h.nurse.staff_id)
        .unwrap();
    assert_eq!(assigned.queue_status, QueueStatus::WithNurse);
    assert_eq!(assigned.nurse_id, Some(h.nurse.staff_id));

    let err = h
        .queue
        .assign_to_nurse(&h.second_nurse, checked_in.visit_id, h.second_nurse.staff_id)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Conflict);

    // The loser changed nothing
    let visit = h.queue.visit_for(&h.nurse, checked_in.visit_id).unwrap();
    assert_eq!(visit.nurse_id, Some(h.nurse.staff_id));
}

#[test]
fn test_concurrent_nurse_claims_have_one_winner() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);

    let mut nurses = vec![h.nurse, h.second_nurse];
    for i in 0..6 {
        let staff = Staff {
            id: Uuid::new_v4(),
            clinic_id: h.clinic.id,
            display_name: format!("Nurse {}", i),
            role: Role::Nurse,
            is_active: true,
        };
        h.store
            .with_conn(|conn| directory::insert_staff(conn, &staff))
            .unwrap();
        nurses.push(staff.identity());
    }

    let barrier = Arc::new(Barrier::new(nurses.len()));
    let handles: Vec<_> = nurses
        .iter()
        .map(|nurse| {
            let queue = h.queue.clone();
            let barrier = barrier.clone();
            let nurse = *nurse;
            thread::spawn(move || {
                barrier.wait();
                queue.assign_to_nurse(&nurse, visit_id, nurse.staff_id)
            })
        })
        .collect();

    let results: Vec<Result<_, EngineError>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert_eq!(e.class(), ErrorClass::Conflict, "unexpected error: {}", e);
        }
    }

    let visit = h.queue.visit_for(&h.nurse, visit_id).unwrap();
    assert_eq!(visit.queue_status, QueueStatus::WithNurse);
    assert_eq!(visit.nurse_id, winners[0].nurse_id);
}

#[test]
fn test_concurrent_doctor_claims_have_one_winner() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::High);
    h.queue
        .assign_to_nurse(&h.nurse, visit_id, h.nurse.staff_id)
        .unwrap();
    h.queue.mark_ready_for_doctor(&h.nurse, visit_id).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [h.doctor, h.second_doctor]
        .into_iter()
        .map(|doctor| {
            let queue = h.queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                queue.claim_patient(&doctor, visit_id)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.is_conflict()));

    let visit = h.queue.visit_for(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.queue_status, QueueStatus::WithDoctor);
    assert!(visit.doctor_id.is_some());
}

#[test]
fn test_tickets_are_stable_after_patients_leave() {
    let h = Harness::new();
    let first = h.check_in(Priority::Normal);
    let second = h.check_in(Priority::Normal);

    h.queue.cancel_visit_queue(&h.nurse, first).unwrap();

    let third = h
        .queue
        .check_in(&h.nurse, h.patient.id, None, Priority::Low)
        .unwrap();
    assert_eq!(third.queue_position, 3);

    let second = h.queue.visit_for(&h.nurse, second).unwrap();
    assert_eq!(second.queue_position, Some(2));
}

#[test]
fn test_board_orders_by_status_then_priority() {
    let h = Harness::new();
    let low = h.check_in(Priority::Low);
    let urgent = h.check_in(Priority::Urgent);
    let with_nurse = h.check_in(Priority::Normal);
    let cancelled = h.check_in(Priority::High);

    h.queue
        .assign_to_nurse(&h.nurse, with_nurse, h.nurse.staff_id)
        .unwrap();
    h.queue.cancel_visit_queue(&h.admin, cancelled).unwrap();

    let board: Vec<Uuid> = h
        .queue
        .get_clinic_queue(&h.nurse, None)
        .unwrap()
        .into_iter()
        .map(|e| e.visit.id)
        .collect();

    assert_eq!(board, vec![urgent, low, with_nurse]);
}

#[test]
fn test_stats_count_each_status() {
    let h = Harness::new();
    let a = h.check_in(Priority::Normal);
    let b = h.check_in(Priority::Normal);
    h.check_in(Priority::Normal);

    h.queue.assign_to_nurse(&h.nurse, a, h.nurse.staff_id).unwrap();
    h.queue.cancel_visit_queue(&h.nurse, b).unwrap();

    let stats = h.queue.queue_stats(&h.admin, None).unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.with_nurse, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.average_wait_minutes, Some(0));
}

#[test]
fn test_roles_are_enforced() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);

    let err = h.queue.claim_patient(&h.nurse, visit_id).unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    // A nurse may only take a patient for themselves
    let err = h
        .queue
        .assign_to_nurse(&h.nurse, visit_id, h.second_nurse.staff_id)
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    // An admin may assign anyone
    let visit = h
        .queue
        .assign_to_nurse(&h.admin, visit_id, h.second_nurse.staff_id)
        .unwrap();
    assert_eq!(visit.nurse_id, Some(h.second_nurse.staff_id));

    // Only the assigned nurse hands over
    let err = h.queue.mark_ready_for_doctor(&h.nurse, visit_id).unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));
}

#[test]
fn test_skipping_a_step_is_a_transition_error() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);

    let err = h.queue.claim_patient(&h.doctor, visit_id).unwrap_err();
    assert!(matches!(err, EngineError::Transition(_)));
    assert_eq!(err.class(), ErrorClass::Validation);
}

#[test]
fn test_complete_requires_notes_in_review() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);

    let err = h.queue.complete_visit_queue(&h.doctor, visit_id).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);

    let visit = h.queue.visit_for(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.queue_status, QueueStatus::Waiting);
}

#[test]
fn test_cancelled_visit_cannot_be_claimed() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);
    h.queue.cancel_visit_queue(&h.nurse, visit_id).unwrap();

    let err = h
        .queue
        .assign_to_nurse(&h.nurse, visit_id, h.nurse.staff_id)
        .unwrap_err();
    assert!(err.is_conflict());

    let err = h.queue.cancel_visit_queue(&h.nurse, visit_id).unwrap_err();
    assert!(err.is_conflict());
}

#[test]
fn test_other_clinic_visit_is_not_found() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);

    let outsider = StaffIdentity::new(Uuid::new_v4(), Uuid::new_v4(), Role::Nurse);
    let err = h.queue.visit_for(&outsider, visit_id).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    let err = h.queue.cancel_visit_queue(&outsider, visit_id).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_priority_update_is_published() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);
    let mut sub = h.queue.subscribe(&h.nurse, None).unwrap();

    let visit = h
        .queue
        .update_priority(&h.nurse, visit_id, Priority::Urgent)
        .unwrap();
    assert_eq!(visit.priority, Priority::Urgent);

    let change = sub.next().await.unwrap();
    assert_eq!(change.visit_id, visit_id);
    assert_eq!(
        change.kind,
        ChangeKind::PriorityChanged {
            priority: Priority::Urgent
        }
    );
}

#[tokio::test]
async fn test_feed_reports_every_transition() {
    let h = Harness::new();
    let mut sub = h.queue.subscribe(&h.nurse, None).unwrap();

    let visit_id = h.check_in(Priority::Normal);
    h.queue
        .assign_to_nurse(&h.nurse, visit_id, h.nurse.staff_id)
        .unwrap();
    h.queue.mark_ready_for_doctor(&h.nurse, visit_id).unwrap();
    h.queue.claim_patient(&h.doctor, visit_id).unwrap();

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let change = sub.next().await.unwrap();
        assert_eq!(change.visit_id, visit_id);
        statuses.push(change.queue_status);
    }

    assert_eq!(
        statuses,
        vec![
            QueueStatus::Waiting,
            QueueStatus::WithNurse,
            QueueStatus::ReadyForDoctor,
            QueueStatus::WithDoctor,
        ]
    );
    assert_eq!(sub.missed(), 0);
}

#[test]
fn test_chief_complaint_edits_stop_at_terminal_states() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);

    let visit = h
        .queue
        .update_chief_complaint(&h.nurse, visit_id, Some("  Headache and fever "))
        .unwrap();
    assert_eq!(visit.chief_complaint.as_deref(), Some("Headache and fever"));

    let visit = h
        .queue
        .update_chief_complaint(&h.nurse, visit_id, Some("   "))
        .unwrap();
    assert!(visit.chief_complaint.is_none());

    h.queue.cancel_visit_queue(&h.nurse, visit_id).unwrap();
    let err = h
        .queue
        .update_chief_complaint(&h.nurse, visit_id, Some("Cough"))
        .unwrap_err();
    assert!(err.is_conflict());
}
