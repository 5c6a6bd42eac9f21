//! Pulse host binary: drives the SDK lifecycle from the command line and
//! waits for the pending queue to settle before exiting.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pulse_core::PulseConfig;
use pulse_sdk::{DeliveryState, FileStore, Pulse, Segmentation, UserProfile};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_STORE_PATH: &str = "pulse-store.json";

#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(about = "Record telemetry and deliver it to a collector")]
#[command(version)]
struct Cli {
    /// Collector base URL (overrides config)
    #[arg(long, env = "PULSE__SERVER_URL")]
    server_url: Option<String>,

    /// Application key (overrides config)
    #[arg(long, env = "PULSE__APP_KEY")]
    app_key: Option<String>,

    /// Developer-supplied device id (overrides config)
    #[arg(long, env = "PULSE__DEVICE_ID")]
    device_id: Option<String>,

    /// File the SDK persists its queue and state in
    #[arg(long, env = "PULSE__STORE_PATH")]
    store: Option<String>,

    /// Seconds to wait for delivery before exiting
    #[arg(long, default_value_t = 30)]
    flush_timeout: u64,

    /// Emit JSON logs
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a custom event
    Event(EventArgs),
    /// Open a session, optionally on a view, and close it again
    Session {
        #[arg(long, default_value_t = 0)]
        seconds: u64,
        #[arg(long)]
        view: Option<String>,
    },
    /// Send a crash report
    Crash {
        #[arg(long)]
        trace: String,
        #[arg(long, default_value_t = false)]
        nonfatal: bool,
    },
    /// Send user profile fields
    User(UserArgs),
    /// Store an install referrer for the next session
    Referrer { raw: String },
    /// Deliver whatever is pending
    Flush,
    /// Discard pending requests and buffered events
    Halt,
    /// Print queue and identity state
    Status,
}

#[derive(Args, Debug)]
struct EventArgs {
    #[arg(long)]
    key: String,
    /// Segmentation as key=value, repeatable
    #[arg(long = "segment", value_parser = parse_pair)]
    segments: Vec<(String, String)>,
    #[arg(long, default_value_t = 1)]
    count: u32,
    #[arg(long)]
    sum: Option<f64>,
}

#[derive(Args, Debug)]
struct UserArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    picture_path: Option<String>,
    /// Custom property as key=value, repeatable
    #[arg(long = "custom", value_parser = parse_pair)]
    custom: Vec<(String, String)>,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pulse=info,pulse_sdk=info".into());
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = PulseConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PulseConfig::default()
    });

    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
    }
    if let Some(app_key) = cli.app_key {
        config.app_key = app_key;
    }
    if let Some(device_id) = cli.device_id {
        config.device_id = Some(device_id);
    }
    if let Some(store) = cli.store {
        config.store_path = Some(store);
    }

    let store_path = config
        .store_path
        .clone()
        .unwrap_or_else(|| DEFAULT_STORE_PATH.to_string());
    let store = FileStore::open(&store_path)
        .with_context(|| format!("failed to open store at {store_path}"))?;

    info!(server_url = %config.server_url, store = %store_path, "Configuration loaded");

    let pulse = Pulse::builder(config)
        .store(Arc::new(store))
        .build()
        .context("failed to initialize pulse")?;

    run(&pulse, cli.command).await?;

    match tokio::time::timeout(Duration::from_secs(cli.flush_timeout), pulse.flush()).await {
        Ok(DeliveryState::Idle) => info!("All requests delivered"),
        Ok(state) => warn!(
            ?state,
            pending = pulse.pending_requests()?,
            "Requests remain queued for the next run"
        ),
        Err(_) => warn!(
            pending = pulse.pending_requests()?,
            "Delivery still in flight at exit"
        ),
    }
    Ok(())
}

async fn run(pulse: &Pulse, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Event(args) => {
            let segmentation: Segmentation = args.segments.into_iter().collect();
            // Ending the session flushes the event buffer.
            pulse.on_start(None)?;
            pulse.record_event(&args.key, segmentation, args.count, args.sum)?;
            pulse.on_stop()?;
        }
        Command::Session { seconds, view } => {
            pulse.set_view_tracking(view.is_some());
            pulse.on_start(view.as_deref())?;
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            pulse.on_stop()?;
        }
        Command::Crash { trace, nonfatal } => pulse.record_crash(&trace, !nonfatal)?,
        Command::User(args) => {
            let profile = UserProfile {
                name: args.name,
                email: args.email,
                username: args.username,
                picture_path: args.picture_path,
                custom: args.custom.into_iter().collect::<BTreeMap<_, _>>(),
                ..Default::default()
            };
            pulse.set_user_data(&profile)?;
        }
        Command::Referrer { raw } => {
            if !pulse.record_install_referrer(&raw)? {
                warn!("Referrer carries no campaign, nothing stored");
            }
        }
        Command::Flush => {}
        Command::Halt => pulse.halt()?,
        Command::Status => {
            let status = serde_json::json!({
                "device_id": pulse.device_id(),
                "strategy": pulse.device_id_kind().to_string(),
                "pending_requests": pulse.pending_requests()?,
                "buffered_events": pulse.buffered_events()?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
