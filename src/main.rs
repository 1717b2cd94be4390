//! iMessage bridge daemon
//!
//! CLI for serving chat.db over HTTP/WebSocket and sending through Messages.app.

use clap::{Parser, Subcommand};
use imessage_bridge::applescript::AppleScriptBackend;
use imessage_bridge::config::Config;
use imessage_bridge::dispatcher::{ActionBackend, ActionDispatcher};
use imessage_bridge::event_cache::{spawn_purge_task, EventCache};
use imessage_bridge::messages::{ChatQuery, MessageStore, MessagesReader};
use imessage_bridge::observer::{NewMessageEvent, RowObserver};
use imessage_bridge::private_api::PrivateApiBackend;
use imessage_bridge::queue::{spawn_prune_task, QueueStore};
use imessage_bridge::reconciler::PendingRegistry;
use imessage_bridge::server::{self, AppState};
use imessage_bridge::service::{SendService, TextSend};
use imessage_bridge::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often stale queue items are dropped
const QUEUE_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// iMessage bridge - chat.db over HTTP and WebSocket
#[derive(Parser)]
#[command(name = "imessage-bridge")]
#[command(about = "Serve Messages.app data and send iMessages over HTTP and WebSocket")]
struct Cli {
    /// Path to chat.db
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory for queue state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Bind host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Bind port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Shared secret clients must pass as `password`
    #[arg(long, global = true)]
    password: Option<String>,

    /// Address of the private API helper (host:port)
    #[arg(long, global = true)]
    private_api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server, row observer and reconciler
    Serve,

    /// Show database and queue status
    Status,

    /// Send one text message and print the resulting row
    Send {
        /// Chat GUID, e.g. iMessage;-;+15551234567
        chat_guid: String,

        /// Message text
        text: String,

        /// Client correlation id (generated if omitted)
        #[arg(long)]
        temp_guid: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Status => cmd_status(&config),
        Commands::Send {
            chat_guid,
            text,
            temp_guid,
        } => cmd_send(config, chat_guid, text, temp_guid).await,
    }
}

/// Defaults, then `IMESSAGE_BRIDGE_*` environment, then flags
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(db) = &cli.db {
        config.messages_db = db.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
        config.queue_file = dir.join("queue.json");
    }
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone()).filter(|p| !p.is_empty());
    }
    if let Some(addr) = &cli.private_api {
        config.private_api_addr = Some(addr.clone()).filter(|a| !a.is_empty());
    }
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Pipeline
// ============================================================================

struct Pipeline {
    service: Arc<SendService>,
    events: broadcast::Sender<NewMessageEvent>,
}

/// Start the reconciler, observer and background tasks, and build the send service
fn start_pipeline(config: &Config) -> Result<Pipeline> {
    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::create_dir_all(&config.attachments_dir)?;

    let queue = Arc::new(QueueStore::new(config));
    let loaded = queue.load()?;
    let max_age = chrono::Duration::hours(config.queue_max_age_hours);
    let pruned = queue.prune_stale(max_age)?;
    info!(loaded, pruned, "queue loaded");
    spawn_prune_task(queue.clone(), max_age, QUEUE_PRUNE_INTERVAL);

    let cache = Arc::new(EventCache::new(config.event_cache_capacity));
    spawn_purge_task(cache.clone(), config.event_cache_purge_interval());

    let (registry, _reconciler) = PendingRegistry::spawn(config.send_timeout(), config.sweep_interval());

    let basic: Arc<dyn ActionBackend> = Arc::new(AppleScriptBackend::new(config));
    let private: Option<Arc<dyn ActionBackend>> = config.private_api_addr.as_deref().map(|addr| {
        info!(addr, "private API enabled");
        Arc::new(PrivateApiBackend::new(addr)) as Arc<dyn ActionBackend>
    });
    let dispatcher = ActionDispatcher::new(basic, private, queue.clone());

    let reader = Arc::new(MessagesReader::new(config));
    let (events, _) = broadcast::channel(256);
    RowObserver::new(
        reader.clone(),
        registry.clone(),
        queue,
        events.clone(),
        config.poll_interval(),
    )
    .spawn();

    let service = Arc::new(SendService::new(config, reader, cache, registry, dispatcher));
    Ok(Pipeline { service, events })
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_serve(config: Config) -> Result<()> {
    info!(?config, "imessage-bridge starting");
    if config.password.is_none() {
        warn!("no password configured; every request will be rejected");
    }

    let pipeline = start_pipeline(&config)?;
    let state = AppState::new(&config, pipeline.service, pipeline.events);
    server::start_server(&config, state).await
}

fn cmd_status(config: &Config) -> Result<()> {
    let reader = MessagesReader::new(config);
    let max_rowid = reader.get_max_rowid()?;
    let chats = reader.get_chats(&ChatQuery::default())?;

    let queue = QueueStore::new(config);
    let queued = queue.load()?;

    println!("Database: {}", config.messages_db.display());
    println!("  max ROWID: {}", max_rowid);
    println!("  chats:     {}", chats.len());
    println!("Queue: {} ({} pending)", config.queue_file.display(), queued);
    println!(
        "Private API: {}",
        config.private_api_addr.as_deref().unwrap_or("disabled")
    );

    Ok(())
}

async fn cmd_send(config: Config, chat_guid: String, text: String, temp_guid: Option<String>) -> Result<()> {
    let pipeline = start_pipeline(&config)?;
    let req = TextSend {
        chat_guid,
        temp_guid: temp_guid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        message: text,
        ..Default::default()
    };

    let message = pipeline.service.send_text(req).await?;
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}
