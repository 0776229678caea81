//! Visit Pipeline Integration Tests
//!
//! Upload with transient storage failures, transcription failure and
//! human retry, finalize with notification fallback, magic links and
//! bounded polling.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use karibu::core::{Cancellation, EngineError, ErrorClass};
use karibu::domain::{
    MessageStatus, MessageVariant, NoteStatus, Priority, ProcessingStatus, QueueStatus, Stage,
    UploadStatus,
};
use karibu::pipeline::{PollOptions, UploadOutcome, UploadRequest};
use karibu::store::{links, messages, notes, uploads, StoreError};
use uuid::Uuid;

use common::{Harness, PATIENT_NOTE, PROVIDER_NOTE};

fn upload_request(h: &Harness, visit_id: Uuid) -> UploadRequest {
    UploadRequest {
        visit_id,
        local_path: h.write_recording(&format!("{}.m4a", visit_id), b"fake m4a audio"),
        duration_seconds: Some(312.5),
    }
}

/// A visit whose notes are waiting for review
async fn reviewed_visit(h: &Harness) -> Uuid {
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(h, visit_id))
        .await
        .unwrap();
    h.pipeline.process_recording(visit_id).await.unwrap();
    visit_id
}

fn status(h: &Harness, visit_id: Uuid) -> ProcessingStatus {
    h.queue.visit_for(&h.doctor, visit_id).unwrap().status
}

#[tokio::test]
async fn test_upload_survives_two_unavailable_responses() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    let request = upload_request(&h, visit_id);
    h.storage.fail_uploads(2);

    let outcome = h.pipeline.upload_audio(&h.doctor, &request).await.unwrap();

    match outcome {
        UploadOutcome::Uploaded {
            storage_path,
            size_bytes,
        } => {
            assert!(storage_path.starts_with(&format!("{}/{}/", h.clinic.id, visit_id)));
            assert!(storage_path.ends_with(".m4a"));
            assert_eq!(size_bytes, 14);
        }
        other => panic!("expected upload, got {:?}", other),
    }

    assert_eq!(h.storage.upload_calls.load(Ordering::SeqCst), 3);
    assert_eq!(status(&h, visit_id), ProcessingStatus::Processing);

    let upload = h.pipeline.audio_status(visit_id).unwrap();
    assert_eq!(upload.status, UploadStatus::Uploaded);
    assert_eq!(upload.duration_seconds, Some(312.5));
    assert!(!request.local_path.exists());
}

#[tokio::test]
async fn test_exhausted_upload_keeps_file_and_can_be_reissued() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    let request = upload_request(&h, visit_id);
    h.storage.fail_uploads(3);

    let err = h.pipeline.upload_audio(&h.doctor, &request).await.unwrap_err();
    assert!(matches!(err, EngineError::RetryExhausted { attempts: 3, .. }));
    assert!(err.is_retryable());

    assert_eq!(status(&h, visit_id), ProcessingStatus::Uploading);
    assert_eq!(
        h.pipeline.audio_status(visit_id).unwrap().status,
        UploadStatus::Failed
    );
    assert!(request.local_path.exists());

    h.pipeline.upload_audio(&h.doctor, &request).await.unwrap();
    assert_eq!(status(&h, visit_id), ProcessingStatus::Processing);
    assert_eq!(h.storage.object_count(), 1);
}

#[tokio::test]
async fn test_upload_requires_consent() {
    let h = Harness::new();
    let visit_id = h.check_in(Priority::Normal);

    let err = h
        .pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert_eq!(h.storage.upload_calls.load(Ordering::SeqCst), 0);
    assert_eq!(status(&h, visit_id), ProcessingStatus::Recording);
}

#[tokio::test]
async fn test_missing_recording_file_is_reported() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    let request = UploadRequest {
        visit_id,
        local_path: h.temp.path().join("gone.m4a"),
        duration_seconds: None,
    };

    let err = h.pipeline.upload_audio(&h.doctor, &request).await.unwrap_err();
    assert!(err.to_string().contains("Recording file not found"));
}

#[tokio::test]
async fn test_confirming_twice_keeps_one_upload() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    let request = upload_request(&h, visit_id);
    h.pipeline.upload_audio(&h.doctor, &request).await.unwrap();

    let first = h.pipeline.audio_status(visit_id).unwrap();
    let path = first.storage_path.clone().unwrap();

    let again = h
        .pipeline
        .confirm_upload(visit_id, &path, Some(312.5), 14)
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.status, UploadStatus::Uploaded);
    assert_eq!(again.uploaded_at, first.uploaded_at);
    assert_eq!(status(&h, visit_id), ProcessingStatus::Processing);

    // A redelivered upload short-circuits without touching storage
    let calls = h.storage.upload_calls.load(Ordering::SeqCst);
    let outcome = h
        .pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    assert_eq!(outcome, UploadOutcome::AlreadyUploaded);
    assert_eq!(h.storage.upload_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_transcription_failure_stops_the_pipeline() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    h.transcriber.fail_always("whisper service unavailable");

    let err = h.pipeline.process_recording(visit_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::PipelineStage {
            stage: Stage::Transcribe,
            ..
        }
    ));

    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.generator.call_count(), 0);

    let upload = h.pipeline.audio_status(visit_id).unwrap();
    assert_eq!(upload.status, UploadStatus::Failed);

    let visit = h.queue.visit_for(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.status, ProcessingStatus::Error);
    assert_eq!(visit.failed_stage, Some(Stage::Transcribe));
    assert!(visit
        .error_message
        .unwrap()
        .contains("whisper service unavailable"));
}

#[tokio::test]
async fn test_retry_from_failed_transcription() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    h.transcriber.fail_always("timeout");
    h.pipeline.process_recording(visit_id).await.unwrap_err();

    h.transcriber.recover();
    let visit = h.pipeline.retry_stage(&h.doctor, visit_id).await.unwrap();

    assert_eq!(visit.status, ProcessingStatus::Review);
    assert!(visit.error_message.is_none());
    assert!(visit.failed_stage.is_none());
    assert_eq!(h.generator.call_count(), 2);

    // Only failed visits can be retried
    let err = h.pipeline.retry_stage(&h.doctor, visit_id).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
}

#[tokio::test]
async fn test_resending_audio_for_a_failed_visit_changes_nothing() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    h.transcriber.fail_always("whisper service unavailable");
    h.pipeline.process_recording(visit_id).await.unwrap_err();

    let err = h
        .pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transition(_)));

    // The failed upload row is untouched, so the stage can still be retried
    let upload = h.pipeline.audio_status(visit_id).unwrap();
    assert_eq!(upload.status, UploadStatus::Failed);
    assert_eq!(status(&h, visit_id), ProcessingStatus::Error);

    h.transcriber.recover();
    let visit = h.pipeline.retry_stage(&h.doctor, visit_id).await.unwrap();
    assert_eq!(visit.status, ProcessingStatus::Review);
}

#[tokio::test]
async fn test_retry_rolls_back_when_upload_moved_on() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    h.transcriber.fail_always("timeout");
    h.pipeline.process_recording(visit_id).await.unwrap_err();

    h.store
        .with_conn(|conn| {
            uploads::transition_upload(
                conn,
                visit_id,
                &[UploadStatus::Failed],
                UploadStatus::Uploading,
                Utc::now(),
            )
        })
        .unwrap();

    let err = h.pipeline.retry_stage(&h.doctor, visit_id).await.unwrap_err();
    assert!(err.is_conflict());

    let visit = h.queue.visit_for(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.status, ProcessingStatus::Error);
    assert_eq!(visit.failed_stage, Some(Stage::Transcribe));
    assert!(visit.error_message.is_some());
}

#[tokio::test]
async fn test_transcript_save_failure_marks_the_stage_failed() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();

    // The service answers, but the transcript cannot be stored
    let store = h.store.clone();
    h.transcriber.before_reply(move || {
        store
            .with_conn(|conn| {
                conn.execute_batch("ALTER TABLE provider_notes RENAME TO provider_notes_offline")
                    .map_err(StoreError::from)
            })
            .unwrap();
    });

    let err = h.pipeline.process_recording(visit_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::PipelineStage {
            stage: Stage::Transcribe,
            ..
        }
    ));
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.pipeline.audio_status(visit_id).unwrap().status,
        UploadStatus::Failed
    );
    let visit = h.queue.visit_for(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.status, ProcessingStatus::Error);
    assert_eq!(visit.failed_stage, Some(Stage::Transcribe));

    h.store
        .with_conn(|conn| {
            conn.execute_batch("ALTER TABLE provider_notes_offline RENAME TO provider_notes")
                .map_err(StoreError::from)
        })
        .unwrap();
    let visit = h.pipeline.retry_stage(&h.doctor, visit_id).await.unwrap();
    assert_eq!(visit.status, ProcessingStatus::Review);
}

#[tokio::test]
async fn test_note_generation_failure_and_retry() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    h.generator.fail_always("model overloaded");

    let err = h.pipeline.process_recording(visit_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::PipelineStage {
            stage: Stage::GenerateNotes,
            ..
        }
    ));
    assert_eq!(h.generator.failed_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.generator.call_count(), 0);

    let visit = h.queue.visit_for(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.status, ProcessingStatus::Error);
    assert_eq!(visit.failed_stage, Some(Stage::GenerateNotes));
    assert!(visit.error_message.unwrap().contains("model overloaded"));

    // The transcript survives the failed generation
    assert_eq!(
        h.pipeline.audio_status(visit_id).unwrap().status,
        UploadStatus::Completed
    );

    h.generator.recover();
    let visit = h.pipeline.retry_stage(&h.doctor, visit_id).await.unwrap();
    assert_eq!(visit.status, ProcessingStatus::Review);
    assert!(visit.failed_stage.is_none());
    assert_eq!(h.generator.call_count(), 2);
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_notes_generated_from_transcript() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;

    let requests = h.generator.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prompt.contains(&h.transcriber.transcript));
    assert!(requests[1].prompt.contains(PROVIDER_NOTE));
    assert!(requests[1].prompt.contains("Sarah"));

    let (provider, patient) = h
        .store
        .with_conn(|conn| {
            Ok::<_, EngineError>((
                notes::get_provider_note(conn, visit_id)?.unwrap(),
                notes::get_patient_note(conn, visit_id)?.unwrap(),
            ))
        })
        .unwrap();
    assert_eq!(provider.content.as_deref(), Some(PROVIDER_NOTE));
    assert_eq!(patient.content.as_deref(), Some(PATIENT_NOTE));
    assert_eq!(patient.status, NoteStatus::Draft);

    // Already in review: nothing is generated again
    let again = h.pipeline.generate_notes(visit_id).await.unwrap();
    assert_eq!(again.provider, PROVIDER_NOTE);
    assert_eq!(h.generator.call_count(), 2);
}

#[tokio::test]
async fn test_processing_status_only_moves_forward() {
    let h = Harness::new();
    let mut seen = vec![];

    let visit_id = h.consented_visit();
    seen.push(status(&h, visit_id));

    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    seen.push(status(&h, visit_id));

    h.pipeline.process_recording(visit_id).await.unwrap();
    seen.push(status(&h, visit_id));

    let outcome = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();
    seen.push(status(&h, visit_id));

    h.pipeline.open_patient_note(&outcome.link.token).unwrap();
    seen.push(status(&h, visit_id));

    assert_eq!(
        seen,
        vec![
            ProcessingStatus::Recording,
            ProcessingStatus::Processing,
            ProcessingStatus::Review,
            ProcessingStatus::Sent,
            ProcessingStatus::Completed,
        ]
    );
    for pair in seen.windows(2) {
        assert!(pair[1].has_reached(pair[0]));
    }

    // Work already done is not redone
    let again = h
        .pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();
    assert_eq!(again, UploadOutcome::AlreadyUploaded);
    assert_eq!(status(&h, visit_id), ProcessingStatus::Completed);
}

#[tokio::test]
async fn test_finalize_sends_template_with_link() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;

    let outcome = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();

    assert_eq!(outcome.message.status, MessageStatus::Sent);
    assert_eq!(outcome.message.variant, MessageVariant::Template);
    assert_eq!(
        outcome.note_url,
        format!("https://karibu.health/note/{}", outcome.link.token)
    );
    let days = (outcome.link.expires_at - Utc::now()).num_days();
    assert!((29..=30).contains(&days));

    let templates = h.notifier.templates.lock().unwrap().clone();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].to, "+256772123456");
    assert_eq!(templates[0].body_params, vec!["Mulago Family Clinic".to_string()]);
    assert_eq!(templates[0].button_param.as_deref(), Some(outcome.link.token.as_str()));

    let visit = h.queue.visit_for(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.status, ProcessingStatus::Sent);
    assert!(visit.finalized_at.is_some());

    let patient = h
        .store
        .with_conn(|conn| notes::get_patient_note(conn, visit_id))
        .unwrap()
        .unwrap();
    assert_eq!(patient.status, NoteStatus::Finalized);
}

#[tokio::test]
async fn test_rejected_template_falls_back_to_text() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;
    h.notifier.reject_templates.store(true, Ordering::SeqCst);

    let outcome = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();

    assert_eq!(outcome.message.variant, MessageVariant::Text);
    assert_eq!(outcome.message.status, MessageStatus::Sent);

    let texts = h.notifier.texts.lock().unwrap().clone();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].1.contains(&outcome.note_url));
    assert!(texts[0].1.contains("30 days"));

    let logs = h
        .store
        .with_conn(|conn| messages::list_for_visit(conn, visit_id))
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message_type, "patient_note");
}

#[tokio::test]
async fn test_refinalizing_leaves_one_live_link() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;

    let first = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();
    let second = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();
    let third = h.pipeline.finalize(&h.admin, visit_id).await.unwrap();
    assert_ne!(first.link.token, third.link.token);
    assert_ne!(second.link.token, third.link.token);

    let now = Utc::now();
    let all = h
        .store
        .with_conn(|conn| links::list_links_for_visit(conn, visit_id))
        .unwrap();
    assert_eq!(all.len(), 3);
    let live: Vec<_> = all.iter().filter(|l| l.is_live(now)).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].token, third.link.token);

    let err = h.pipeline.open_patient_note(&first.link.token).unwrap_err();
    assert!(err.to_string().contains("expired"));
}

#[tokio::test]
async fn test_finalize_rules() {
    let h = Harness::new();
    let visit_id = h.consented_visit();

    let err = h.pipeline.finalize(&h.nurse, visit_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let err = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Transition(_)));
    assert!(h.notifier.templates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_draft_edits_and_finalized_lock() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;

    h.pipeline
        .update_patient_note(&h.doctor, visit_id, "Rest, fluids, come back on Friday.")
        .unwrap();
    let outcome = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();

    let view = h.pipeline.open_patient_note(&outcome.link.token).unwrap();
    assert_eq!(view.content, "Rest, fluids, come back on Friday.");

    let err = h
        .pipeline
        .update_provider_note(&h.doctor, visit_id, "late edit")
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
}

#[tokio::test]
async fn test_first_open_completes_the_visit() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;
    let outcome = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();

    let view = h.pipeline.open_patient_note(&outcome.link.token).unwrap();
    assert_eq!(view.clinic_name, "Mulago Family Clinic");
    assert_eq!(view.patient_name.as_deref(), Some("Sarah"));
    assert_eq!(view.content, PATIENT_NOTE);
    assert_eq!(status(&h, visit_id), ProcessingStatus::Completed);

    // Reopening is fine and changes nothing
    h.pipeline.open_patient_note(&outcome.link.token).unwrap();
    assert_eq!(status(&h, visit_id), ProcessingStatus::Completed);

    let err = h.pipeline.open_patient_note("not-a-token").unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_request_new_link_by_phone() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;
    let first = h.pipeline.finalize(&h.doctor, visit_id).await.unwrap();

    let reissued = h.pipeline.request_new_link("0772 123 456").await.unwrap();
    assert_eq!(reissued.link.visit_id, visit_id);
    assert_ne!(reissued.link.token, first.link.token);
    assert_eq!(h.notifier.templates.lock().unwrap().len(), 2);

    assert!(h.pipeline.open_patient_note(&first.link.token).is_err());
    h.pipeline.open_patient_note(&reissued.link.token).unwrap();

    let err = h.pipeline.request_new_link("12").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);

    let err = h.pipeline.request_new_link("0700 000 000").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_queue_completes_once_notes_are_in_review() {
    let h = Harness::new();
    let visit_id = reviewed_visit(&h).await;

    let visit = h.queue.complete_visit_queue(&h.doctor, visit_id).unwrap();
    assert_eq!(visit.queue_status, QueueStatus::Completed);
    assert_eq!(visit.status, ProcessingStatus::Review);
}

#[tokio::test]
async fn test_wait_for_transcription_outcomes() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();

    let quick = PollOptions {
        interval: Duration::from_millis(5),
        max_attempts: 3,
    };

    let err = h
        .pipeline
        .wait_for_transcription(visit_id, quick, &Cancellation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PollTimeout { attempts: 3, .. }));

    let cancel = Cancellation::new();
    cancel.cancel();
    let err = h
        .pipeline
        .wait_for_transcription(visit_id, quick, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));

    h.pipeline.transcribe(visit_id).await.unwrap();
    let upload = h
        .pipeline
        .wait_for_transcription(visit_id, quick, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Completed);
}

#[tokio::test]
async fn test_cancel_stops_a_long_wait() {
    let h = Harness::new();
    let visit_id = h.consented_visit();
    h.pipeline
        .upload_audio(&h.doctor, &upload_request(&h, visit_id))
        .await
        .unwrap();

    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let slow = PollOptions {
        interval: Duration::from_secs(60),
        max_attempts: 10,
    };
    let started = std::time::Instant::now();
    let err = h
        .pipeline
        .wait_for_transcription(visit_id, slow, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}
