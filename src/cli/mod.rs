//! CLI interface for karibu.

pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{OpenAiClient, StorageClient, WhatsAppClient};
use crate::config::{self, paths};
use crate::core::{Cancellation, Retry};
use crate::domain::{
    format_phone_number, is_valid_phone, Clinic, ClinicalFields, Patient, Priority, Role, Staff,
    StaffIdentity,
};
use crate::pipeline::{PipelineServices, PollOptions, UploadOutcome, UploadRequest, VisitPipeline};
use crate::queue::{QueueEngine, QueueFeed};
use crate::store::{directory, Store};

/// karibu - clinic visit queue and note pipeline
#[derive(Parser)]
#[command(name = "karibu")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the local state directory and database
    Init,

    /// Manage clinics
    Clinic {
        #[command(subcommand)]
        command: ClinicCommands,
    },

    /// Manage staff accounts
    Staff {
        #[command(subcommand)]
        command: StaffCommands,
    },

    /// Register patients
    Patient {
        #[command(subcommand)]
        command: PatientCommands,
    },

    /// Check a patient in to today's queue
    CheckIn {
        /// Acting staff member ID
        #[arg(long)]
        staff: String,

        /// Patient ID
        #[arg(long)]
        patient: String,

        /// Reason for the visit
        #[arg(short, long)]
        complaint: Option<String>,

        /// low, normal, high or urgent
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// Show the clinic board
    Queue {
        /// Acting staff member ID
        #[arg(long)]
        staff: String,

        /// Clinic-local day (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Show board counts and wait times
    Stats {
        /// Acting staff member ID
        #[arg(long)]
        staff: String,

        /// Clinic-local day (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Take a waiting patient (nurse), or assign one (admin)
    Assign {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,

        /// Nurse to assign, defaults to the acting staff member
        #[arg(long)]
        nurse: Option<String>,
    },

    /// Hand a patient over to the doctors
    Ready {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Claim a patient who is ready for a doctor
    Claim {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Complete a visit on the board
    Complete {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Cancel a visit
    Cancel {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Change a visit's priority
    Priority {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,

        /// low, normal, high or urgent
        priority: String,
    },

    /// Record that the patient consented to recording
    Consent {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Upload a recording for a visit
    Upload {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,

        /// Recording file
        file: PathBuf,

        /// Recording length in seconds
        #[arg(short, long)]
        duration: Option<f64>,
    },

    /// Transcribe an uploaded recording and generate the notes
    Process {
        /// Visit ID
        visit: String,

        /// Wait for transcription to complete instead of processing inline
        #[arg(long)]
        wait: bool,
    },

    /// Enter clinical fields for a visit
    Clinical {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,

        #[arg(long)]
        diagnosis: Option<String>,

        #[arg(long)]
        medications: Option<String>,

        #[arg(long)]
        follow_up: Option<String>,

        #[arg(long)]
        tests: Option<String>,
    },

    /// Edit a draft note
    EditNote {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,

        /// Edit the patient note instead of the provider note
        #[arg(long)]
        patient: bool,

        /// File holding the new note text
        file: PathBuf,
    },

    /// Retry the stage a visit failed at
    Retry {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Finalize the notes and send the patient their link
    Finalize {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Show the state of a visit
    Status {
        #[arg(long)]
        staff: String,

        /// Visit ID
        visit: String,
    },

    /// Open a patient note by magic-link token
    OpenNote {
        /// Token from the link
        token: String,
    },

    /// Send a fresh link to a patient's latest note
    RequestLink {
        /// Patient phone number
        phone: String,
    },

    /// Offline upload queue
    Sync {
        #[command(subcommand)]
        command: sync::SyncCommands,
    },

    /// Show the resolved configuration
    Config,
}

#[derive(Subcommand)]
pub enum ClinicCommands {
    /// Create a clinic
    Add {
        /// Clinic name
        name: String,

        /// Offset of local time from UTC in minutes
        #[arg(long, default_value = "180", allow_hyphen_values = true)]
        utc_offset: i32,
    },

    /// List clinics
    List,
}

#[derive(Subcommand)]
pub enum StaffCommands {
    /// Add a staff member to a clinic
    Add {
        /// Clinic ID
        #[arg(long)]
        clinic: String,

        /// admin, doctor or nurse
        #[arg(short, long)]
        role: String,

        /// Display name
        name: String,
    },

    /// List staff of a clinic
    List {
        /// Clinic ID
        #[arg(long)]
        clinic: String,
    },
}

#[derive(Subcommand)]
pub enum PatientCommands {
    /// Register a patient (returns the existing one for a known number)
    Add {
        #[arg(long)]
        staff: String,

        /// WhatsApp number
        phone: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Init => init().await,
            Commands::Config => show_config(),
            Commands::Clinic { command } => execute_clinic(command),
            Commands::Staff { command } => execute_staff(command),
            Commands::Patient { command } => execute_patient(command),
            Commands::Sync { command } => sync::execute(command).await,
            Commands::OpenNote { token } => open_note(&token),
            Commands::RequestLink { phone } => request_link(&phone).await,
            Commands::Process { visit, wait } => process(&visit, wait).await,
            command => execute_visit(command).await,
        }
    }
}

/// Everything a command needs from local state
struct App {
    store: Arc<Store>,
    queue: QueueEngine,
}

impl App {
    fn open() -> Result<Self> {
        let db = paths::database()?;
        let store = Arc::new(
            Store::open(&db).with_context(|| format!("Failed to open database: {}", db.display()))?,
        );
        let queue = QueueEngine::new(store.clone(), QueueFeed::default());
        Ok(Self { store, queue })
    }

    /// Resolve `--staff` to the identity it acts as
    fn identity(&self, staff: &str) -> Result<StaffIdentity> {
        let id = parse_id("staff", staff)?;
        let staff = self
            .store
            .with_conn(|conn| directory::get_staff(conn, id))?
            .with_context(|| format!("Staff member not found: {}", id))?;

        if !staff.is_active {
            bail!("Staff member {} is inactive", staff.display_name);
        }
        Ok(staff.identity())
    }

    fn pipeline(&self) -> Result<VisitPipeline> {
        build_pipeline(self.store.clone())
    }
}

/// Wire the pipeline to the configured external services
pub(crate) fn build_pipeline(store: Arc<Store>) -> Result<VisitPipeline> {
    let cfg = config::config()?;
    let services = PipelineServices {
        storage: Arc::new(StorageClient::new(cfg.services.storage.clone())?),
        transcriber: Arc::new(OpenAiClient::new(cfg.services.openai.clone())?),
        generator: Arc::new(OpenAiClient::new(cfg.services.openai.clone())?),
        notifier: Arc::new(WhatsAppClient::new(cfg.services.whatsapp.clone())?),
    };

    Ok(VisitPipeline::new(
        store,
        services,
        Retry::new(cfg.retry.clone()),
        cfg.pipeline.clone(),
    ))
}

fn parse_id(what: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid {} ID: {}", what, value))
}

fn parse_date(value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .map(|d| {
            NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                .with_context(|| format!("Invalid date (expected YYYY-MM-DD): {}", d))
        })
        .transpose()
}

fn parse_priority(value: &str) -> Result<Priority> {
    value
        .parse()
        .with_context(|| format!("Invalid priority: {}", value))
}

async fn init() -> Result<()> {
    let cfg = config::config()?;
    tokio::fs::create_dir_all(&cfg.home)
        .await
        .with_context(|| format!("Failed to create {}", cfg.home.display()))?;
    tokio::fs::create_dir_all(&cfg.recordings).await?;

    if let Some(parent) = cfg.database.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Store::open(&cfg.database)?;

    println!("Initialized karibu in {}", cfg.home.display());
    println!("  Database:   {}", cfg.database.display());
    println!("  Recordings: {}", cfg.recordings.display());
    Ok(())
}

fn execute_clinic(command: ClinicCommands) -> Result<()> {
    let app = App::open()?;

    match command {
        ClinicCommands::Add { name, utc_offset } => {
            let clinic = Clinic {
                id: Uuid::new_v4(),
                name: name.trim().to_string(),
                utc_offset_minutes: utc_offset,
            };
            if clinic.name.is_empty() {
                bail!("Clinic name must not be empty");
            }
            app.store
                .with_conn(|conn| directory::insert_clinic(conn, &clinic))?;
            println!("Clinic created: {}", clinic.id);
        }
        ClinicCommands::List => {
            let clinics = app.store.with_conn(directory::list_clinics)?;
            if clinics.is_empty() {
                println!("No clinics found.");
                return Ok(());
            }

            println!("{:<38} {:<30} {:>10}", "CLINIC ID", "NAME", "UTC OFFSET");
            println!("{}", "-".repeat(80));
            for clinic in clinics {
                println!(
                    "{:<38} {:<30} {:>10}",
                    clinic.id, clinic.name, clinic.utc_offset_minutes
                );
            }
        }
    }

    Ok(())
}

fn execute_staff(command: StaffCommands) -> Result<()> {
    let app = App::open()?;

    match command {
        StaffCommands::Add { clinic, role, name } => {
            let clinic_id = parse_id("clinic", &clinic)?;
            let role: Role = role.parse().with_context(|| format!("Invalid role: {}", role))?;
            app.store
                .with_conn(|conn| directory::get_clinic(conn, clinic_id))?
                .with_context(|| format!("Clinic not found: {}", clinic_id))?;

            let staff = Staff {
                id: Uuid::new_v4(),
                clinic_id,
                display_name: name,
                role,
                is_active: true,
            };
            app.store
                .with_conn(|conn| directory::insert_staff(conn, &staff))?;
            println!("Staff member created: {} ({})", staff.id, staff.role);
        }
        StaffCommands::List { clinic } => {
            let clinic_id = parse_id("clinic", &clinic)?;
            let staff = app
                .store
                .with_conn(|conn| directory::list_staff(conn, clinic_id))?;

            println!("{:<38} {:<25} {:<8} {:<6}", "STAFF ID", "NAME", "ROLE", "ACTIVE");
            println!("{}", "-".repeat(80));
            for member in staff {
                println!(
                    "{:<38} {:<25} {:<8} {:<6}",
                    member.id,
                    member.display_name,
                    member.role,
                    if member.is_active { "yes" } else { "no" }
                );
            }
        }
    }

    Ok(())
}

fn execute_patient(command: PatientCommands) -> Result<()> {
    let app = App::open()?;

    match command {
        PatientCommands::Add { staff, phone, name } => {
            let actor = app.identity(&staff)?;
            if !is_valid_phone(&phone) {
                bail!("Invalid phone number: {}", phone);
            }

            let patient = Patient {
                id: Uuid::new_v4(),
                clinic_id: actor.clinic_id,
                whatsapp_number: format_phone_number(&phone),
                display_name: name,
            };
            let patient = app
                .store
                .with_conn(|conn| directory::register_patient(conn, &patient))?;
            println!("Patient: {} ({})", patient.id, patient.whatsapp_number);
        }
    }

    Ok(())
}

/// Commands acting on a visit as a staff member
async fn execute_visit(command: Commands) -> Result<()> {
    let app = App::open()?;

    match command {
        Commands::CheckIn {
            staff,
            patient,
            complaint,
            priority,
        } => {
            let actor = app.identity(&staff)?;
            let patient_id = parse_id("patient", &patient)?;
            let checked_in =
                app.queue
                    .check_in(&actor, patient_id, complaint, parse_priority(&priority)?)?;
            println!(
                "Checked in: {} (ticket #{})",
                checked_in.visit_id, checked_in.queue_position
            );
        }

        Commands::Queue { staff, date } => {
            let actor = app.identity(&staff)?;
            let entries = app.queue.get_clinic_queue(&actor, parse_date(date)?)?;
            if entries.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }

            println!(
                "{:<6} {:<38} {:<18} {:<8} {:<16} {:>6}",
                "TICKET", "VISIT ID", "QUEUE", "PRIORITY", "PROCESSING", "WAIT"
            );
            println!("{}", "-".repeat(98));
            for entry in entries {
                let visit = &entry.visit;
                println!(
                    "{:<6} {:<38} {:<18} {:<8} {:<16} {:>6}",
                    visit
                        .queue_position
                        .map(|p| format!("#{}", p))
                        .unwrap_or_else(|| "-".to_string()),
                    visit.id,
                    visit.queue_status,
                    visit.priority,
                    visit.status,
                    entry
                        .wait_minutes
                        .map(|m| format!("{}m", m))
                        .unwrap_or_default()
                );
            }
        }

        Commands::Stats { staff, date } => {
            let actor = app.identity(&staff)?;
            let stats = app.queue.queue_stats(&actor, parse_date(date)?)?;
            let minutes = |m: Option<i64>| m.map(|m| format!("{}m", m)).unwrap_or_else(|| "-".into());

            println!("Waiting:          {}", stats.waiting);
            println!("With nurse:       {}", stats.with_nurse);
            println!("Ready for doctor: {}", stats.ready_for_doctor);
            println!("With doctor:      {}", stats.with_doctor);
            println!("Completed:        {}", stats.completed);
            println!("Cancelled:        {}", stats.cancelled);
            println!("Average wait:     {}", minutes(stats.average_wait_minutes));
            println!("Longest wait:     {}", minutes(stats.longest_wait_minutes));
        }

        Commands::Assign {
            staff,
            visit,
            nurse,
        } => {
            let actor = app.identity(&staff)?;
            let nurse_id = match nurse {
                Some(n) => parse_id("nurse", &n)?,
                None => actor.staff_id,
            };
            let visit = app
                .queue
                .assign_to_nurse(&actor, parse_id("visit", &visit)?, nurse_id)?;
            println!("Visit {} is now {}", visit.id, visit.queue_status);
        }

        Commands::Ready { staff, visit } => {
            let actor = app.identity(&staff)?;
            let visit = app
                .queue
                .mark_ready_for_doctor(&actor, parse_id("visit", &visit)?)?;
            println!("Visit {} is now {}", visit.id, visit.queue_status);
        }

        Commands::Claim { staff, visit } => {
            let actor = app.identity(&staff)?;
            let visit = app.queue.claim_patient(&actor, parse_id("visit", &visit)?)?;
            println!("Visit {} is now {}", visit.id, visit.queue_status);
        }

        Commands::Complete { staff, visit } => {
            let actor = app.identity(&staff)?;
            let visit = app
                .queue
                .complete_visit_queue(&actor, parse_id("visit", &visit)?)?;
            println!("Visit {} is now {}", visit.id, visit.queue_status);
        }

        Commands::Cancel { staff, visit } => {
            let actor = app.identity(&staff)?;
            let visit = app
                .queue
                .cancel_visit_queue(&actor, parse_id("visit", &visit)?)?;
            println!("Visit {} is now {}", visit.id, visit.queue_status);
        }

        Commands::Priority {
            staff,
            visit,
            priority,
        } => {
            let actor = app.identity(&staff)?;
            let visit = app.queue.update_priority(
                &actor,
                parse_id("visit", &visit)?,
                parse_priority(&priority)?,
            )?;
            println!("Visit {} priority is now {}", visit.id, visit.priority);
        }

        Commands::Consent { staff, visit } => {
            let actor = app.identity(&staff)?;
            let visit = app
                .pipeline()?
                .record_consent(&actor, parse_id("visit", &visit)?)?;
            println!("Consent recorded for visit {}", visit.id);
        }

        Commands::Upload {
            staff,
            visit,
            file,
            duration,
        } => {
            let actor = app.identity(&staff)?;
            let request = UploadRequest {
                visit_id: parse_id("visit", &visit)?,
                local_path: file,
                duration_seconds: duration,
            };

            match app.pipeline()?.upload_audio(&actor, &request).await {
                Ok(UploadOutcome::Uploaded {
                    storage_path,
                    size_bytes,
                }) => println!("Uploaded {} bytes to {}", size_bytes, storage_path),
                Ok(UploadOutcome::AlreadyUploaded) => {
                    println!("Recording was already uploaded for this visit")
                }
                Err(e) => bail!(e.user_message()),
            }
        }

        Commands::Clinical {
            staff,
            visit,
            diagnosis,
            medications,
            follow_up,
            tests,
        } => {
            let actor = app.identity(&staff)?;
            let fields = ClinicalFields {
                diagnosis,
                medications,
                follow_up_instructions: follow_up,
                tests_ordered: tests,
            };
            let visit = app.pipeline()?.update_clinical_fields(
                &actor,
                parse_id("visit", &visit)?,
                &fields,
            )?;
            println!("Clinical fields saved for visit {}", visit.id);
        }

        Commands::EditNote {
            staff,
            visit,
            patient,
            file,
        } => {
            let actor = app.identity(&staff)?;
            let visit_id = parse_id("visit", &visit)?;
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let pipeline = app.pipeline()?;
            if patient {
                pipeline.update_patient_note(&actor, visit_id, &content)?;
            } else {
                pipeline.update_provider_note(&actor, visit_id, &content)?;
            }
            println!("Note updated for visit {}", visit_id);
        }

        Commands::Retry { staff, visit } => {
            let actor = app.identity(&staff)?;
            let visit = app
                .pipeline()?
                .retry_stage(&actor, parse_id("visit", &visit)?)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Visit {} is now {}", visit.id, visit.status);
        }

        Commands::Finalize { staff, visit } => {
            let actor = app.identity(&staff)?;
            let outcome = app
                .pipeline()?
                .finalize(&actor, parse_id("visit", &visit)?)
                .await?;

            println!("Notes finalized.");
            println!("  Link:    {}", outcome.note_url);
            println!("  Expires: {}", outcome.link.expires_at.format("%Y-%m-%d"));
            println!(
                "  Message: {} ({})",
                outcome.message.status, outcome.message.variant
            );
        }

        Commands::Status { staff, visit } => {
            let actor = app.identity(&staff)?;
            let visit = app.queue.visit_for(&actor, parse_id("visit", &visit)?)?;

            println!("Visit:      {}", visit.id);
            println!("Date:       {}", visit.visit_date);
            println!("Queue:      {}", visit.queue_status);
            println!("Processing: {}", visit.status);
            println!("Priority:   {}", visit.priority);
            if let Some(complaint) = &visit.chief_complaint {
                println!("Complaint:  {}", complaint);
            }
            if let Some(stage) = visit.failed_stage {
                println!(
                    "Failed at:  {} ({})",
                    stage,
                    visit.error_message.as_deref().unwrap_or("unknown error")
                );
            }
            if let Ok(upload) = app.pipeline()?.audio_status(visit.id) {
                println!(
                    "Recording:  {} ({})",
                    upload.status,
                    upload.storage_path.as_deref().unwrap_or("not stored")
                );
            }
        }

        _ => bail!("Not a visit command"),
    }

    Ok(())
}

async fn process(visit: &str, wait: bool) -> Result<()> {
    let app = App::open()?;
    let pipeline = app.pipeline()?;
    let visit_id = parse_id("visit", visit)?;

    if wait {
        let cancel = Cancellation::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctrl_c.cancel();
            }
        });

        pipeline
            .wait_for_transcription(visit_id, PollOptions::from_config(pipeline.config()), &cancel)
            .await?;
        println!("Transcription complete for visit {}", visit_id);
        return Ok(());
    }

    let notes = pipeline
        .process_recording(visit_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    println!("Notes generated for visit {}", visit_id);
    println!();
    println!("Provider note:");
    println!("{}", notes.provider);
    println!();
    println!("Patient note:");
    println!("{}", notes.patient);
    Ok(())
}

fn open_note(token: &str) -> Result<()> {
    let app = App::open()?;
    let view = app.pipeline()?.open_patient_note(token)?;

    println!("{} - {}", view.clinic_name, view.visit_date);
    if let Some(name) = &view.patient_name {
        println!("For: {}", name);
    }
    println!();
    println!("{}", view.content);
    for line in view.clinical.context_lines() {
        println!("{}", line);
    }
    println!();
    println!("Link expires {}", view.expires_at.format("%Y-%m-%d"));
    Ok(())
}

async fn request_link(phone: &str) -> Result<()> {
    let app = App::open()?;
    let outcome = app.pipeline()?.request_new_link(phone).await?;
    println!("New link sent ({})", outcome.message.status);
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("  Karibu Configuration");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:          {}", cfg.home.display());
    println!("  Database:      {}", cfg.database.display());
    println!("  Recordings:    {}", cfg.recordings.display());
    println!("  Pending queue: {}", cfg.pending_queue().display());
    println!();
    println!("Retry:");
    println!("  Max attempts:  {}", cfg.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!();
    println!("Sync:");
    println!("  Debounce:      {}ms", cfg.sync.debounce_ms);
    println!("  Retry every:   {}s", cfg.sync.retry_interval_secs);
    println!(
        "  Probe:         {}",
        cfg.sync.probe_url.as_deref().unwrap_or("(none)")
    );
    println!();
    println!("Services:");
    let set = |v: &Option<String>| if v.is_some() { "set" } else { "missing" };
    println!(
        "  Storage:  {} (key {})",
        cfg.services.storage.base_url,
        set(&cfg.services.storage.service_key)
    );
    println!(
        "  OpenAI:   {} (key {})",
        cfg.services.openai.base_url,
        set(&cfg.services.openai.api_key)
    );
    println!(
        "  WhatsApp: {} (token {})",
        cfg.services.whatsapp.graph_url,
        set(&cfg.services.whatsapp.access_token)
    );
    println!("  Notes at: {}", cfg.pipeline.web_url);

    Ok(())
}
