//! Shared fixtures for integration tests: scripted service fakes and a
//! seeded in-memory clinic.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use karibu::adapters::{
    classify_status, AdapterOutput, GenerationRequest, MessageReceipt, NotificationTransport,
    ObjectStorage, SpeechToText, TemplateMessage, TextGenerator,
};
use karibu::core::{EngineError, Retry, RetryPolicy};
use karibu::domain::{Clinic, Patient, Priority, Role, Staff, StaffIdentity};
use karibu::pipeline::{PipelineConfig, PipelineServices, VisitPipeline};
use karibu::queue::{QueueEngine, QueueFeed};
use karibu::store::{directory, Store};

const SIGNED_PREFIX: &str = "memory://";

/// In-memory object storage that can fail uploads with HTTP 503
#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failures_left: AtomicU32,
    pub upload_calls: AtomicU32,
}

impl FakeStorage {
    /// Fail the next `n` uploads as unavailable
    pub fn fail_uploads(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn signed_upload_url(
        &self,
        path: &str,
        _expires_in: Duration,
    ) -> Result<String, EngineError> {
        Ok(format!("{}{}", SIGNED_PREFIX, path))
    }

    async fn upload(
        &self,
        signed_url: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), EngineError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(classify_status("storage", 503, "Service Unavailable"));
        }

        let path = signed_url.trim_start_matches(SIGNED_PREFIX).to_string();
        self.objects.lock().unwrap().insert(path, bytes);
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| classify_status("storage", 404, "Object not found"))
    }
}

/// Runs once, just before the fake service answers
pub type Hook = Box<dyn FnOnce() + Send>;

/// Speech-to-text that returns a fixed transcript, or always fails
pub struct FakeTranscriber {
    pub transcript: String,
    pub fail_with: Mutex<Option<String>>,
    hook: Mutex<Option<Hook>>,
    pub calls: AtomicU32,
}

impl Default for FakeTranscriber {
    fn default() -> Self {
        Self {
            transcript: "Patient reports a dry cough for three days. No fever.".to_string(),
            fail_with: Mutex::new(None),
            hook: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }
}

impl FakeTranscriber {
    pub fn fail_always(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    pub fn before_reply(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl SpeechToText for FakeTranscriber {
    async fn transcribe(
        &self,
        _audio: Vec<u8>,
        _file_name: &str,
        _language: &str,
    ) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        match self.fail_with.lock().unwrap().clone() {
            Some(message) => Err(EngineError::transient(message)),
            None => Ok(self.transcript.clone()),
        }
    }
}

pub const PROVIDER_NOTE: &str = "SOAP: acute bronchitis, supportive care.";
pub const PATIENT_NOTE: &str = "You have a chest cold. Rest and drink fluids.";

/// Generator that answers the provider prompt first, then the patient prompt
#[derive(Default)]
pub struct FakeGenerator {
    pub requests: Mutex<Vec<GenerationRequest>>,
    pub fail_with: Mutex<Option<String>>,
    pub failed_calls: AtomicU32,
}

impl FakeGenerator {
    /// Successful generations so far
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn fail_always(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.fail_with.lock().unwrap() = None;
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<AdapterOutput, EngineError> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::transient(message));
        }
        let mut requests = self.requests.lock().unwrap();
        let content = if requests.len() % 2 == 0 {
            PROVIDER_NOTE
        } else {
            PATIENT_NOTE
        };
        requests.push(request.clone());
        Ok(AdapterOutput::new(content.to_string()))
    }
}

/// Notification transport that records what it was asked to send
#[derive(Default)]
pub struct FakeNotifier {
    pub reject_templates: AtomicBool,
    pub templates: Mutex<Vec<TemplateMessage>>,
    pub texts: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl NotificationTransport for FakeNotifier {
    fn channel(&self) -> &str {
        "whatsapp"
    }

    async fn send_template(&self, message: &TemplateMessage) -> Result<MessageReceipt, EngineError> {
        if self.reject_templates.load(Ordering::SeqCst) {
            return Err(classify_status("whatsapp", 400, "Template not approved"));
        }
        self.templates.lock().unwrap().push(message.clone());
        Ok(MessageReceipt {
            external_id: Some(format!("wamid.{}", Uuid::new_v4().simple())),
        })
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<MessageReceipt, EngineError> {
        self.texts
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(MessageReceipt {
            external_id: Some(format!("wamid.{}", Uuid::new_v4().simple())),
        })
    }
}

/// A clinic with one admin, two nurses, two doctors and a patient
pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<Store>,
    pub queue: QueueEngine,
    pub pipeline: VisitPipeline,
    pub storage: Arc<FakeStorage>,
    pub transcriber: Arc<FakeTranscriber>,
    pub generator: Arc<FakeGenerator>,
    pub notifier: Arc<FakeNotifier>,
    pub clinic: Clinic,
    pub admin: StaffIdentity,
    pub nurse: StaffIdentity,
    pub second_nurse: StaffIdentity,
    pub doctor: StaffIdentity,
    pub second_doctor: StaffIdentity,
    pub patient: Patient,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retry(RetryPolicy::immediate(3))
    }

    pub fn with_retry(policy: RetryPolicy) -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());

        let clinic = Clinic {
            id: Uuid::new_v4(),
            name: "Mulago Family Clinic".to_string(),
            utc_offset_minutes: 0,
        };
        store
            .with_conn(|conn| directory::insert_clinic(conn, &clinic))
            .unwrap();

        let admin = add_staff(&store, clinic.id, "Grace", Role::Admin);
        let nurse = add_staff(&store, clinic.id, "Amina", Role::Nurse);
        let second_nurse = add_staff(&store, clinic.id, "Joseph", Role::Nurse);
        let doctor = add_staff(&store, clinic.id, "Dr. Okello", Role::Doctor);
        let second_doctor = add_staff(&store, clinic.id, "Dr. Nansubuga", Role::Doctor);

        let patient = store
            .with_conn(|conn| {
                directory::register_patient(
                    conn,
                    &Patient {
                        id: Uuid::new_v4(),
                        clinic_id: clinic.id,
                        whatsapp_number: "+256772123456".to_string(),
                        display_name: Some("Sarah".to_string()),
                    },
                )
            })
            .unwrap();

        let storage = Arc::new(FakeStorage::default());
        let transcriber = Arc::new(FakeTranscriber::default());
        let generator = Arc::new(FakeGenerator::default());
        let notifier = Arc::new(FakeNotifier::default());

        let services = PipelineServices {
            storage: storage.clone(),
            transcriber: transcriber.clone(),
            generator: generator.clone(),
            notifier: notifier.clone(),
        };
        let pipeline = VisitPipeline::new(
            store.clone(),
            services,
            Retry::new(policy),
            PipelineConfig::default(),
        );
        let queue = QueueEngine::new(store.clone(), QueueFeed::default());

        Self {
            temp,
            store,
            queue,
            pipeline,
            storage,
            transcriber,
            generator,
            notifier,
            clinic,
            admin,
            nurse,
            second_nurse,
            doctor,
            second_doctor,
            patient,
        }
    }

    /// Register another patient at the clinic
    pub fn add_patient(&self, phone: &str) -> Patient {
        self.store
            .with_conn(|conn| {
                directory::register_patient(
                    conn,
                    &Patient {
                        id: Uuid::new_v4(),
                        clinic_id: self.clinic.id,
                        whatsapp_number: phone.to_string(),
                        display_name: None,
                    },
                )
            })
            .unwrap()
    }

    pub fn check_in(&self, priority: Priority) -> Uuid {
        self.queue
            .check_in(&self.nurse, self.patient.id, Some("Cough".to_string()), priority)
            .unwrap()
            .visit_id
    }

    /// A checked-in visit with recording consent
    pub fn consented_visit(&self) -> Uuid {
        let visit_id = self.check_in(Priority::Normal);
        self.pipeline.record_consent(&self.doctor, visit_id).unwrap();
        visit_id
    }

    /// Write a fake recording into the temp dir
    pub fn write_recording(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.temp.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

fn add_staff(store: &Store, clinic_id: Uuid, name: &str, role: Role) -> StaffIdentity {
    let staff = Staff {
        id: Uuid::new_v4(),
        clinic_id,
        display_name: name.to_string(),
        role,
        is_active: true,
    };
    store
        .with_conn(|conn| directory::insert_staff(conn, &staff))
        .unwrap();
    staff.identity()
}
