//! wardsync - sync a ward's records and inspect them offline.
//!
//! ```text
//! wardsync sync                 run a full sync against the configured server
//! wardsync tree                 print the location tree with patient counts
//! wardsync patients [search]    list patients, optionally filtered by id or name
//! wardsync status               show when the last full sync completed
//! ```

use std::io;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wardsync_core::events::{
    CrudEvent, FetchedCursor, GlobalEvent, GlobalEventKind, Interest, Listener, Subscriber,
};
use wardsync_core::cursor::FilteredCursor;
use wardsync_core::filter::{AllFilter, PatientSearchMatcher};
use wardsync_core::location::LocationTree;
use wardsync_core::models::Patient;
use wardsync_core::{App, Config};

// ============================================================================
// Constants
// ============================================================================

/// Directory for a daily rolling log file, in addition to stderr
const LOG_DIR_VAR: &str = "WARDSYNC_LOG_DIR";

const USAGE: &str = "usage: wardsync <sync|tree|patients [search]|status>";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_VAR) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "wardsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let config = Config::load()?;
    let app = App::open(&config)?;
    info!(command = %command, "wardsync starting");

    match command.as_str() {
        "sync" => sync(&app).await,
        "tree" => tree(&app).await,
        "patients" => patients(&app, args.get(1).map(String::as_str).unwrap_or("")).await,
        "status" => status(&app),
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

async fn sync(app: &App) -> Result<()> {
    eprintln!("Syncing...");
    if let Err(reason) = app.sync_now().await {
        bail!("sync failed: {}", reason);
    }
    status(app)
}

/// Print the resident tree, syncing first when there is none.
async fn tree(app: &App) -> Result<()> {
    let loaded: Arc<Mutex<Option<GlobalEvent>>> = Arc::new(Mutex::new(None));
    let listener: Arc<dyn Subscriber<GlobalEvent>> = {
        let loaded = loaded.clone();
        Listener::new(
            Interest::Kinds(vec![
                GlobalEventKind::LocationsLoaded,
                GlobalEventKind::LocationsLoadFailed,
            ]),
            move |event: &GlobalEvent| *loaded.lock() = Some(event.clone()),
        )
    };
    app.global_bus().register(listener.clone());

    app.locations().build();
    let event = loop {
        if let Some(event) = loaded.lock().take() {
            break event;
        }
        app.next().await;
    };
    app.global_bus().unregister(&listener);

    match event {
        GlobalEvent::LocationsLoaded(tree) => {
            for root in tree.roots() {
                print_node(&tree, root.uuid(), 0);
            }
            Ok(())
        }
        GlobalEvent::LocationsLoadFailed { reason } => bail!("could not load locations: {}", reason),
        _ => Ok(()),
    }
}

fn print_node(tree: &LocationTree, uuid: &str, depth: usize) {
    let count = tree.patient_count(uuid).unwrap_or(0);
    println!("{}{} ({})", "  ".repeat(depth), tree.display_name(uuid), count);
    for child in tree.children(uuid) {
        print_node(tree, child.uuid(), depth + 1);
    }
}

async fn patients(app: &App, search: &str) -> Result<()> {
    let bus = app.crud_bus("cli");
    let received: Arc<Mutex<Option<CrudEvent>>> = Arc::new(Mutex::new(None));
    let listener: Arc<dyn Subscriber<CrudEvent>> = {
        let received = received.clone();
        Listener::new(Interest::All, move |event: &CrudEvent| {
            *received.lock() = Some(event.clone())
        })
    };
    bus.register(listener);

    app.model().fetch_patients(&bus, &AllFilter, "");
    let event = loop {
        if let Some(event) = received.lock().take() {
            break event;
        }
        app.next().await;
    };

    let cursor = match event {
        CrudEvent::CursorFetched(FetchedCursor::Patients(cursor)) => cursor,
        CrudEvent::TaskFailed(failure) => bail!("{}", failure.message),
        _ => bail!("unexpected reply"),
    };
    let filtered = FilteredCursor::new(cursor, &PatientSearchMatcher, search)?;
    for patient in filtered.iter()? {
        print_patient(patient);
    }
    eprintln!("{} patient(s)", filtered.count());
    filtered.close();
    Ok(())
}

fn print_patient(patient: &Patient) {
    println!(
        "{:<12} {:<32} {}",
        patient.id.as_deref().unwrap_or("-"),
        patient.full_name(),
        patient.location_uuid.as_deref().unwrap_or("-"),
    );
}

fn status(app: &App) -> Result<()> {
    match app.model().last_full_sync_time() {
        Some(at) => println!("Last full sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("No complete full sync"),
    }
    Ok(())
}
