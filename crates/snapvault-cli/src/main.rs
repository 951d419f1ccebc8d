use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use snapvault_core::{FaceDetector, MockDetector};
use snapvault_engine::{spawn_ingest_worker, Config, EngineError, SearchEngine};
use snapvault_store::{EmbeddingStore, Event, MatchLedger, SqliteStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "snapvault", about = "Event photo face matching")]
struct Cli {
    /// Path to the SQLite database (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage events
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Upload photos to an event; faces are detected in the background
    Upload {
        /// Event access code
        event_code: String,
        /// Image files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Identity recorded as the uploader
        #[arg(long, default_value = "organizer")]
        uploader: String,
    },
    /// Find photos of yourself in an event with a selfie
    Search {
        /// Event access code
        event_code: String,
        /// Selfie image file
        selfie: PathBuf,
        /// Identity the matches are recorded for
        #[arg(long)]
        requester: String,
    },
    /// List recorded matches for a requester
    Matches {
        #[arg(long)]
        requester: String,
    },
    /// Show store statistics
    Stats,
}

#[derive(Subcommand)]
enum EventCommands {
    /// Create a new event
    Create {
        /// Display name
        name: String,
        /// Access code attendees will type in
        code: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List all events
    List,
    /// Deactivate an event (no further uploads)
    Close {
        /// Access code of the event to close
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    tracing::debug!(db = %config.db_path.display(), "opening store");
    let store = SqliteStore::open(&config.db_path).await?;
    let detector: Arc<dyn FaceDetector> = Arc::new(MockDetector::new(config.embedding_dim));

    match cli.command {
        Commands::Event { command } => run_event(command, &store).await?,
        Commands::Upload {
            event_code,
            files,
            uploader,
        } => run_upload(&store, detector, &config, &event_code, &files, &uploader).await?,
        Commands::Search {
            event_code,
            selfie,
            requester,
        } => run_search(&store, detector, &config, &event_code, &selfie, &requester).await?,
        Commands::Matches { requester } => run_matches(&store, &requester).await?,
        Commands::Stats => run_stats(&store).await?,
    }

    Ok(())
}

async fn require_event(store: &SqliteStore, code: &str) -> Result<Event> {
    match store.event_by_code(code).await? {
        Some(event) => Ok(event),
        None => bail!("no event with code {code:?}"),
    }
}

async fn run_event(command: EventCommands, store: &SqliteStore) -> Result<()> {
    match command {
        EventCommands::Create {
            name,
            code,
            description,
        } => {
            let event = store
                .create_event(&name, &code, description.as_deref())
                .await?;
            println!("Created event #{} {:?} (code {})", event.id, event.name, event.code);
        }
        EventCommands::List => {
            let events = store.list_events().await?;
            if events.is_empty() {
                println!("No events");
            }
            for event in events {
                println!(
                    "#{} {} [{}] {}",
                    event.id,
                    event.code,
                    if event.is_active { "active" } else { "closed" },
                    event.name,
                );
            }
        }
        EventCommands::Close { code } => {
            let event = require_event(store, &code).await?;
            store.set_event_active(event.id, false).await?;
            println!("Closed event {}", event.code);
        }
    }
    Ok(())
}

async fn run_upload(
    store: &SqliteStore,
    detector: Arc<dyn FaceDetector>,
    config: &Config,
    event_code: &str,
    files: &[PathBuf],
    uploader: &str,
) -> Result<()> {
    let event = require_event(store, event_code).await?;
    if !event.is_active {
        bail!("event {} is closed", event.code);
    }

    let (handle, worker) = spawn_ingest_worker(store.clone(), detector, config);

    let mut photo_ids = Vec::new();
    for path in files {
        let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let photo = store.create_photo(event.id, &filename, uploader).await?;
        handle.submit(photo.id, image).await?;
        photo_ids.push(photo.id);
    }
    println!("Queued {} photo(s) for processing", photo_ids.len());

    // Close the queue and wait for it to drain before reporting.
    drop(handle);
    worker.await.context("ingest worker panicked")?;

    for photo_id in photo_ids {
        if let Some(photo) = store.photo(photo_id).await? {
            println!("  #{} {}: {:?}", photo.id, photo.filename, photo.status);
        }
    }
    Ok(())
}

async fn run_search(
    store: &SqliteStore,
    detector: Arc<dyn FaceDetector>,
    config: &Config,
    event_code: &str,
    selfie: &Path,
    requester: &str,
) -> Result<()> {
    let event = require_event(store, event_code).await?;
    let image =
        std::fs::read(selfie).with_context(|| format!("reading {}", selfie.display()))?;

    let engine = SearchEngine::new(store.clone(), detector, config);
    let outcome = match engine.search(requester, event.id, &image).await {
        Ok(outcome) => outcome,
        Err(EngineError::NoFaceDetected) => {
            println!("No face detected in the selfie; try a clearer picture.");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    if outcome.matches.is_empty() {
        println!(
            "No matches among {} candidate face(s).",
            outcome.candidates_considered
        );
        return Ok(());
    }

    println!(
        "Found {} photo match(es) (searched {} candidate face(s)):",
        outcome.matches.len(),
        outcome.candidates_considered
    );
    for m in &outcome.matches {
        let filename = store
            .photo(m.photo_id)
            .await?
            .map(|p| p.filename)
            .unwrap_or_else(|| format!("photo #{}", m.photo_id));
        println!("  {:>3}%  {}", m.confidence_percent, filename);
    }
    Ok(())
}

async fn run_matches(store: &SqliteStore, requester: &str) -> Result<()> {
    let records = store.matches_for_requester(requester).await?;
    if records.is_empty() {
        println!("No matches recorded for {requester}");
        return Ok(());
    }
    for record in records {
        let filename = store
            .photo(record.photo_id)
            .await?
            .map(|p| p.filename)
            .unwrap_or_else(|| format!("photo #{}", record.photo_id));
        println!(
            "{}  {:>3}%  {}  (event #{}{})",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.confidence_percent,
            filename,
            record.event_id,
            if record.notified { ", notified" } else { "" },
        );
    }
    Ok(())
}

async fn run_stats(store: &SqliteStore) -> Result<()> {
    let stats = store.stats().await?;
    println!("events:           {}", stats.events);
    println!("photos:           {}", stats.photos);
    println!("  processed:      {}", stats.processed_photos);
    println!("faces indexed:    {}", stats.detections);
    println!("matches recorded: {}", stats.matches);
    Ok(())
}
