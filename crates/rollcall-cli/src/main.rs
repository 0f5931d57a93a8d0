use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceStore, Identity, PresenceFilter, StatisticalPresenceFilter};
use rollcall_hw::Camera;
use rollcall_store::SqliteStore;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start(&self) -> zbus::Result<()>;
    fn stop(&self) -> zbus::Result<bool>;
    fn open_session(&self, class_id: &str) -> zbus::Result<i64>;
    fn close_session(&self) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
    fn recent_events(&self, limit: u32) -> zbus::Result<String>;
    fn create_collection(&self) -> zbus::Result<bool>;
    fn list_faces(&self) -> zbus::Result<String>;
    fn clear_faces(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance by face recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the camera and start recognizing
    Start,
    /// Stop recognizing and release the camera
    Stop,
    /// Open an attendance session for a class (closes any open one)
    Open {
        /// Class identifier
        class: String,
    },
    /// Close the open attendance session
    Close,
    /// Show daemon status
    Status,
    /// Show recent attendance events
    Events {
        /// Number of events to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Manage the remote face collection through the daemon
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },
    /// Manage classes and rosters (works without the daemon)
    Roster {
        /// Path to the attendance database
        #[arg(long, env = "ROLLCALL_DB_PATH")]
        db: Option<PathBuf>,
        #[command(subcommand)]
        action: RosterAction,
    },
    /// Show who was present in a session (works without the daemon)
    Report {
        /// Path to the attendance database
        #[arg(long, env = "ROLLCALL_DB_PATH")]
        db: Option<PathBuf>,
        /// Session id; defaults to the open session, or the latest one
        session: Option<i64>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame and report what the pipeline would see
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the captured frame as an image (e.g. frame.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RosterAction {
    /// Create a class
    AddClass { class: String },
    /// Enroll a person in a class; the name is normalized to an identity
    Enroll { class: String, name: String },
    /// Remove an identity from a class roster
    Unenroll { class: String, identity: String },
    /// List classes, or the roster of one class
    List { class: Option<String> },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Create the configured collection if it does not exist
    Create,
    /// List the faces stored in the collection
    List,
    /// Delete every face in the collection
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            daemon().await?.start().await?;
            println!("pipeline started");
        }
        Commands::Stop => {
            if daemon().await?.stop().await? {
                println!("pipeline stopped");
            } else {
                println!("pipeline was not running");
            }
        }
        Commands::Open { class } => {
            let session_id = daemon().await?.open_session(&class).await?;
            println!("session {session_id} opened for class {class}");
        }
        Commands::Close => {
            let closed = daemon().await?.close_session().await?;
            if closed == 0 {
                println!("no session was open");
            } else {
                println!("session closed");
            }
        }
        Commands::Status => {
            let status = daemon().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Events { limit } => {
            let events = daemon().await?.recent_events(limit).await?;
            let events: Vec<serde_json::Value> = serde_json::from_str(&events)?;
            if events.is_empty() {
                println!("no attendance events yet");
            }
            for event in events {
                println!(
                    "{}  {:<24} {:<16} {:>5.1}  session {}",
                    event["timestamp"].as_str().unwrap_or("-"),
                    event["identity"].as_str().unwrap_or("-"),
                    event["outcome"].as_str().unwrap_or("-"),
                    event["confidence"].as_f64().unwrap_or(0.0),
                    event["session_id"]
                        .as_i64()
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        Commands::Collection { action } => collection(action).await?,
        Commands::Roster { db, action } => roster(open_store(db)?, action)?,
        Commands::Report { db, session } => report(open_store(db)?, session)?,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test { device, output } => test_camera(&device, output)?,
    }

    Ok(())
}

async fn daemon() -> Result<AttendanceProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    tracing::debug!(unique_name = ?connection.unique_name(), "connected to session bus");
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")
}

async fn collection(action: CollectionAction) -> Result<()> {
    let proxy = daemon().await?;
    match action {
        CollectionAction::Create => {
            if proxy.create_collection().await? {
                println!("collection created");
            } else {
                println!("collection already exists");
            }
        }
        CollectionAction::List => {
            let faces: Vec<serde_json::Value> = serde_json::from_str(&proxy.list_faces().await?)?;
            if faces.is_empty() {
                println!("no faces in the collection");
            }
            for face in &faces {
                println!(
                    "{}  {}",
                    face["face_id"].as_str().unwrap_or("-"),
                    face["external_image_id"].as_str().unwrap_or("-"),
                );
            }
        }
        CollectionAction::Clear { yes } => {
            anyhow::ensure!(yes, "refusing to delete every face without --yes");
            let deleted = proxy.clear_faces().await?;
            println!("{deleted} faces deleted");
        }
    }
    Ok(())
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let path = db.unwrap_or_else(rollcall_store::default_db_path);
    SqliteStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

fn roster(store: SqliteStore, action: RosterAction) -> Result<()> {
    match action {
        RosterAction::AddClass { class } => {
            if store.create_class(&class)? {
                println!("class {class} created");
            } else {
                println!("class {class} already exists");
            }
        }
        RosterAction::Enroll { class, name } => {
            let identity = store.enroll(&class, &name)?;
            println!("enrolled {identity} in {class}");
        }
        RosterAction::Unenroll { class, identity } => {
            if store.unenroll(&class, &Identity::from(identity.as_str()))? {
                println!("removed {identity} from {class}");
            } else {
                println!("{identity} is not enrolled in {class}");
            }
        }
        RosterAction::List { class: None } => {
            let classes = store.list_classes()?;
            if classes.is_empty() {
                println!("no classes");
            }
            for class in classes {
                println!("{:<24} {} enrolled", class.id, class.enrolled);
            }
        }
        RosterAction::List { class: Some(class) } => {
            anyhow::ensure!(store.class_exists(&class)?, "unknown class {class:?}");
            for identity in store.roster(&class)? {
                println!("{identity}");
            }
        }
    }
    Ok(())
}

fn report(store: SqliteStore, session: Option<i64>) -> Result<()> {
    let session = match session {
        Some(id) => store
            .session(id)?
            .with_context(|| format!("no session {id}"))?,
        None => match store.current_session()? {
            Some(open) => open,
            None => store
                .recent_sessions(1)?
                .into_iter()
                .next()
                .context("no sessions recorded yet")?,
        },
    };

    println!(
        "session {}: class {} ({}), opened {}",
        session.id,
        session.class_id,
        session.status.as_str(),
        session.opened_at.format("%Y-%m-%d %H:%M:%S")
    );
    let present = store.presences(session.id)?;
    let roster = store.roster(&session.class_id)?;
    for identity in &roster {
        match present.iter().find(|p| &p.identity == identity) {
            Some(p) => println!("  present  {identity}  {}", p.recorded_at.format("%H:%M:%S")),
            None => println!("  absent   {identity}"),
        }
    }
    println!("{}/{} present", present.len(), roster.len());
    Ok(())
}

fn test_camera(device: &str, output: Option<PathBuf>) -> Result<()> {
    println!("Opening {device}...");
    let mut camera = Camera::open(device, 640, 480)?;
    println!(
        "Negotiated {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let frame = camera.capture_frame()?;
    let filter = StatisticalPresenceFilter::default();
    println!("Frame #{}: {} bytes", frame.sequence, frame.data.len());
    println!("  brightness: {:.1}", frame.avg_brightness());
    println!("  dark:       {}", frame.is_dark);
    println!(
        "  candidate:  {}",
        if filter.has_candidate_face(&frame) {
            "yes (would be sent for matching)"
        } else {
            "no (would be skipped)"
        }
    );

    if let Some(path) = output {
        image::save_buffer(
            &path,
            &frame.data,
            frame.width,
            frame.height,
            image::ExtendedColorType::L8,
        )
        .with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}
