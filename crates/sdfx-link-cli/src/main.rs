use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sdfx_link_client::rest::{ItemList, QueuePosition, RestError};
use sdfx_link_client::{ConnectionState, ProgressTracker, Session};
use sdfx_link_core::config::Config;
use sdfx_link_core::events::{Event, EventData, EventKind};
use sdfx_link_core::identity::{FileIdentityStore, IdentityStore};
use sdfx_link_core::protocol::ControlEnvelope;
use sdfx_link_core::report::{format_execution_error, format_prompt_error};
use serde_json::{Value, json};
use tracing::{info, warn};

mod logging;

#[derive(Parser)]
#[command(
    name = "sdfx-link",
    about = "Realtime session client for SDFX / ComfyUI-style backends",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream backend events to stdout as JSON lines
    Watch {
        /// Client id to connect as (default: the persisted one)
        #[arg(long)]
        client_id: Option<String>,

        /// Extra message types to subscribe to, besides the built-in ones
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<String>,

        /// Write preview images into this directory
        #[arg(long)]
        save_previews: Option<PathBuf>,
    },

    /// Send one control message over the realtime connection
    Send {
        /// Message type
        kind: String,

        /// Message segment
        #[arg(long)]
        segment: Option<String>,

        /// JSON payload
        #[arg(long)]
        data: Option<String>,

        #[arg(long)]
        client_id: Option<String>,
    },

    /// Queue a prompt graph from a JSON file
    Prompt {
        file: PathBuf,

        /// Insert at the front of the queue
        #[arg(long)]
        front: bool,
    },

    /// Show the execution queue
    Queue {
        #[command(subcommand)]
        action: Option<ListAction>,
    },

    /// Show execution history
    History {
        /// Maximum number of entries
        #[arg(long, default_value_t = 50)]
        max_items: u32,

        #[command(subcommand)]
        action: Option<ListAction>,
    },

    /// Interrupt the running prompt
    Interrupt,

    /// List available node types
    Nodes,

    /// Show connection settings and backend reachability
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ListAction {
    /// Delete one item
    Delete { id: String },
    /// Remove every item
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init_logging(&config.logging(), cli.verbose)?;

    match cli.command {
        Commands::Watch {
            client_id,
            kinds,
            save_previews,
        } => watch(&config, client_id, kinds, save_previews).await?,
        Commands::Send {
            kind,
            segment,
            data,
            client_id,
        } => {
            let mut envelope = ControlEnvelope::new(kind);
            if let Some(segment) = segment {
                envelope = envelope.with_segment(segment);
            }
            if let Some(data) = data {
                envelope = envelope.with_data(serde_json::from_str(&data).context("Invalid --data JSON")?);
            }

            let session = Session::from_config(&config)?;
            session.connect(client_id, None);
            wait_connected(&session, Duration::from_secs(10)).await?;
            session.send(envelope)?;
            session.shutdown().await;
        }
        Commands::Prompt { file, front } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let graph: Value = serde_json::from_str(&raw)?;
            let position = if front {
                QueuePosition::Front
            } else {
                QueuePosition::Back
            };

            let session = Session::from_config(&config)?;
            match session
                .rest()
                .queue_prompt(&session.client_id(), position, &graph, None)
                .await
            {
                Ok(queued) => println!("{}", serde_json::to_string_pretty(&queued)?),
                Err(e) => match e.body_json() {
                    Some(body) => anyhow::bail!("{}", format_prompt_error(&body)),
                    None => return Err(e.into()),
                },
            }
        }
        Commands::Queue { action } => {
            let rest = Session::from_config(&config)?.rest();
            match action {
                None => {
                    let queue = rest.get_queue().await?;
                    println!("{}", serde_json::to_string_pretty(&queue)?);
                }
                Some(ListAction::Delete { id }) => rest.delete_item(ItemList::Queue, &id).await?,
                Some(ListAction::Clear) => rest.clear_items(ItemList::Queue).await?,
            }
        }
        Commands::History { max_items, action } => {
            let rest = Session::from_config(&config)?.rest();
            match action {
                None => {
                    let history = rest.get_history(max_items).await?;
                    println!("{}", serde_json::to_string_pretty(&history)?);
                }
                Some(ListAction::Delete { id }) => rest.delete_item(ItemList::History, &id).await?,
                Some(ListAction::Clear) => rest.clear_items(ItemList::History).await?,
            }
        }
        Commands::Interrupt => {
            Session::from_config(&config)?.rest().interrupt().await?;
            info!("Interrupt requested");
        }
        Commands::Nodes => {
            let defs = Session::from_config(&config)?.rest().get_node_defs().await?;
            let mut names: Vec<&String> = defs
                .as_object()
                .map(|map| map.keys().collect())
                .unwrap_or_default();
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
        Commands::Status => status(&config, &config_path).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s)", errors.len());
                }
                println!("Config OK");
            }
        },
    }

    Ok(())
}

async fn watch(
    config: &Config,
    client_id: Option<String>,
    extra_kinds: Vec<String>,
    save_previews: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(dir) = &save_previews {
        std::fs::create_dir_all(dir)?;
    }

    let session = Session::from_config(config)?;
    let tracker = Arc::new(Mutex::new(ProgressTracker::new()));
    let saved = Arc::new(AtomicUsize::new(0));

    let kinds = EventKind::FIXED
        .iter()
        .cloned()
        .chain(extra_kinds.into_iter().map(EventKind::from));
    for kind in kinds {
        let tracker = tracker.clone();
        let saved = saved.clone();
        let dir = save_previews.clone();
        session.on(kind, move |event| {
            print_event(event, &tracker, dir.as_deref(), &saved)
        });
    }

    session.connect(client_id, None);

    let mut state = session.watch_state();
    let gave_up = tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        _ = state.wait_for(|s| *s == ConnectionState::Failed) => true,
    };
    session.shutdown().await;

    let stats = session.stats();
    info!(
        frames = stats.frames_received,
        malformed = stats.malformed_frames,
        unknown = stats.unknown_kinds,
        callback_failures = stats.callback_failures,
        "Session closed"
    );
    if gave_up {
        anyhow::bail!("Gave up reconnecting to {}", session.endpoints().ws);
    }
    Ok(())
}

fn print_event(
    event: &Event,
    tracker: &Mutex<ProgressTracker>,
    save_dir: Option<&Path>,
    saved: &AtomicUsize,
) -> anyhow::Result<()> {
    let progress = tracker
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .observe(event, Instant::now());

    let mut line = json!({ "type": event.kind.as_str() });
    if let Some(segment) = &event.segment {
        line["segment"] = json!(segment);
    }
    match &event.data {
        EventData::Empty => {}
        EventData::Json(value) => line["data"] = value.clone(),
        EventData::Preview(image) => {
            line["data"] = json!({ "format": image.format.extension(), "bytes": image.bytes.len() });
            if let Some(dir) = save_dir {
                let n = saved.fetch_add(1, Ordering::Relaxed);
                let path = dir.join(format!("preview-{n:05}.{}", image.format.extension()));
                std::fs::write(&path, &image.bytes)?;
                line["saved"] = json!(path.display().to_string());
            }
        }
    }
    if let Some(p) = progress {
        line["progress"] = json!({
            "percent": p.percent,
            "remaining_steps": p.remaining_steps,
            "eta_secs": p.eta.as_secs_f64(),
            "steps_per_second": p.steps_per_second,
        });
    }

    if event.kind == EventKind::ExecutionError {
        if let Some(data) = event.data.as_json() {
            eprintln!("{}", format_execution_error(data));
        }
    }
    println!("{line}");
    Ok(())
}

async fn wait_connected(session: &Session, timeout: Duration) -> anyhow::Result<()> {
    let mut state = session.watch_state();
    let settled = tokio::time::timeout(
        timeout,
        state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed)),
    )
    .await;
    let connected = match settled {
        Ok(Ok(state)) => state.is_connected(),
        _ => false,
    };
    if !connected {
        session.disconnect();
        anyhow::bail!("Could not connect to {}", session.endpoints().ws);
    }
    Ok(())
}

async fn status(config: &Config, config_path: &Path) -> anyhow::Result<()> {
    println!("sdfx-link v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        warn!("{warning}");
    }
    for error in &errors {
        println!("Config error: {error}");
    }

    let endpoints = config.endpoints()?;
    println!("HTTP endpoint: {}", endpoints.http);
    println!("WebSocket endpoint: {}", endpoints.ws);
    println!(
        "Auth token: {}",
        if config.auth_token().is_some() { "set" } else { "not set" }
    );

    let identity_path = config.identity_path();
    let client_id = FileIdentityStore::new(&identity_path).load();
    println!(
        "Client id: {} ({})",
        client_id.as_deref().unwrap_or("(none)"),
        identity_path.display()
    );
    println!(
        "Reconnect: every {} ms, up to {} attempts",
        config.reconnect_delay().as_millis(),
        config.max_reconnect_attempts()
    );

    let rest = Session::from_config(config)?.rest();
    match rest.get_queue().await {
        Ok(queue) => println!(
            "Backend: reachable ({} running, {} pending)",
            queue.queue_running.len(),
            queue.queue_pending.len()
        ),
        Err(RestError::Unreachable(e)) => println!("Backend: unreachable ({e})"),
        Err(e) => println!("Backend: error ({e})"),
    }
    Ok(())
}
