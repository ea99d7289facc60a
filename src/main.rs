/// Entry point for the carequeue service.
///
/// `serve` (the default) runs the HTTP API with the daily reset timer;
/// `demo` walks a short session through an in-memory store and prints it.

use anyhow::{Context, Result};
use carequeue::config::{Cli, Command, Settings, StorageKind};
use carequeue::models::{Hospital, Patient, PatientLookup};
use carequeue::{
    AppState, CounterStore, DailyResetScheduler, HospitalRepository, MemoryStore, PatientRepository, QueueStore,
    RegistrationRequest, SledStore, TokioDailyTimer,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::load();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command() {
        Command::Serve => serve(&cli.settings).await,
        Command::Demo => run_demo(&cli.settings).await,
    }
}

fn open_store(settings: &Settings) -> Result<Arc<dyn QueueStore>> {
    match settings.storage {
        StorageKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageKind::Sled => {
            let store = SledStore::open(&settings.data_dir)
                .with_context(|| format!("failed to open sled store at {}", settings.data_dir.display()))?;
            info!(path = %settings.data_dir.display(), "opened sled store");
            Ok(Arc::new(store))
        }
    }
}

async fn serve(settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;

    let reset = DailyResetScheduler::new(
        Arc::new(TokioDailyTimer),
        store.clone(),
        settings.reset_at,
        settings.utc_offset,
    );
    let reset_task = reset.start();

    let listener = TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind))?;
    let state = AppState::new(store, settings.utc_offset);

    carequeue::serve(listener, state, shutdown_signal())
        .await
        .context("server error")?;

    reset_task.abort();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_demo(settings: &Settings) -> Result<()> {
    println!("\n--- Running Demo ---");

    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone(), settings.utc_offset);

    let hospital = store
        .insert_hospital(Hospital::new(
            "City Care".to_string(),
            "12 MG Road".to_string(),
            "080-1234".to_string(),
        )?)
        .await?;
    println!("Created hospital {} ({})", hospital.name, hospital.id);

    let people = [("Asha", "9800000001"), ("Bilal", "9800000002"), ("Chen", "9800000003")];
    for (name, phone) in people {
        store.insert_patient(Patient::new(name.to_string(), phone.to_string())?).await?;
        let registration = state
            .issuer()
            .register(hospital.id, RegistrationRequest::new(PatientLookup::Phone(phone.to_string())))
            .await?;
        println!("  {:<8} -> token {}", registration.appointment.patient_name, registration.token());
    }

    let counters = store.counters(hospital.id).await?;
    println!(
        "\nNext token to issue: {}, live counter: {}, waiting: {}",
        counters.issued,
        counters.serving,
        counters.waiting()
    );

    println!("\nCalling patients:");
    for _ in 0..4 {
        let outcome = state.advancer().advance(hospital.id).await?;
        let done = outcome
            .current_patient
            .map(|p| format!("{} (token {})", p.name, p.token_number))
            .unwrap_or_else(|| "-".to_string());
        let next = outcome
            .next_patient
            .map(|p| format!("{} (token {})", p.name, p.token_number))
            .unwrap_or_else(|| "nobody".to_string());
        println!(
            "  live counter {:>2} | completed {:<18} | now serving {}",
            outcome.live_counter, done, next
        );
    }

    let today = settings.utc_offset.today();
    println!("\nToday's list ({}):", today);
    for appointment in store.appointments_for_day(hospital.id, today).await? {
        println!(
            "  token {:>2}  {:<8} {}",
            appointment.token_number, appointment.patient_name, appointment.status
        );
    }

    let report = store.reset_all().await?;
    let counters = store.counters(hospital.id).await?;
    println!(
        "\nAfter daily reset of {} hospital(s): next token {}, live counter {}",
        report.reset.len(),
        counters.issued,
        counters.serving
    );
    Ok(())
}
