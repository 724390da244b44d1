#![forbid(unsafe_code)]

mod config;
mod constants;
mod control;
mod detection;
mod ipc;
mod lifecycle;
mod overlay;
mod permission;
mod persistence;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn, Level as TraceLevel};
use tracing_subscriber::FmtSubscriber;

use config::{DaemonSettings, SettingsOrigin};
use control::spawn_control_listener;
use detection::{build_detector, DetectorKind};
use ipc::{ControlClient, ControlRequest, ControlResponse, ControlServer};
use lifecycle::{LifecycleHandle, LifecycleManager};
use overlay::{OverlayBridge, SocketBridge, UnavailableBridge};
use permission::{PermissionState, StaticPermissionProvider};
use persistence::FileStore;

#[derive(Parser)]
#[command(version, about = "Detection-driven blur overlay daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Run(RunArgs),
    /// Talk to a running daemon
    Ctl(CtlArgs),
}

#[derive(Args, Default)]
struct RunArgs {
    /// Directory for settings and stored detection state
    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Overlay renderer socket
    #[arg(long)]
    bridge_socket: Option<PathBuf>,

    /// Run without an overlay renderer
    #[arg(long, conflicts_with = "bridge_socket")]
    no_bridge: bool,

    #[arg(long, value_enum)]
    detector: Option<DetectorKind>,

    /// Answer given by the static permission provider
    #[arg(long, value_enum)]
    permission: Option<PermissionState>,
}

#[derive(Args)]
struct CtlArgs {
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Subcommand)]
enum CtlCommand {
    /// Print the current state snapshot
    Status,
    Activate,
    Deactivate,
    /// Change one setting, e.g. `set blurIntensity 20`
    Set { field: String, value: String },
    /// Re-query the permission service
    RecheckPermission,
    /// Stream state changes and detection results
    Watch,
    Ping,
    /// Ask the daemon to exit
    Shutdown,
}

fn parse_level(level: &str) -> TraceLevel {
    match level.to_lowercase().as_str() {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    }
}

/// `LOG_LEVEL` wins over the settings file
fn init_logging(fallback: &str) -> Result<()> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| fallback.to_string());
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&level))
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to install log subscriber")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Ctl(args)) => {
            init_logging("warn")?;
            run_ctl(args)
        }
        Some(Command::Run(args)) => run_daemon(args),
        None => run_daemon(RunArgs::default()),
    }
}

fn run_daemon(args: RunArgs) -> Result<()> {
    let settings_path = match &args.config_dir {
        Some(dir) => dir.join(constants::config::SETTINGS_FILENAME),
        None => DaemonSettings::path(),
    };
    let (settings, origin) = DaemonSettings::load_from(&settings_path)?;
    init_logging(&settings.log_level)?;
    match origin {
        SettingsOrigin::Created => info!(path = %settings_path.display(), "Settings file not found, created defaults"),
        SettingsOrigin::Loaded => info!(path = %settings_path.display(), "Loaded settings"),
    }

    let store = match &args.config_dir {
        Some(dir) => FileStore::new(dir.clone()),
        None => FileStore::in_config_dir(),
    };
    info!(dir = %store.dir().display(), "Using detection state directory");

    let permission = args.permission.unwrap_or(settings.permission);
    let detector = args.detector.unwrap_or(settings.detector);
    info!(permission = %permission, detector = ?detector, "Daemon configured");

    let bridge: Box<dyn OverlayBridge> = if args.no_bridge {
        info!("Overlay renderer disabled");
        Box::new(UnavailableBridge)
    } else {
        let path = match args.bridge_socket.or(settings.bridge_socket) {
            Some(path) => Ok(path),
            None => ipc::default_overlay_socket(),
        };
        match path {
            Ok(path) => {
                info!(socket = %path.display(), "Using overlay renderer socket");
                Box::new(SocketBridge::new(path))
            }
            Err(e) => {
                warn!(error = %e, "No overlay renderer socket, overlay unavailable");
                Box::new(UnavailableBridge)
            }
        }
    };

    let control_socket = match args.control_socket.or(settings.control_socket) {
        Some(path) => path,
        None => ipc::default_control_socket()?,
    };

    let manager = LifecycleManager::new(
        Box::new(store),
        Box::new(StaticPermissionProvider::new(permission)),
        build_detector(detector),
        bridge,
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(serve(manager, control_socket))
}

async fn serve(mut manager: LifecycleManager, control_socket: PathBuf) -> Result<()> {
    let restored = manager.restore().await;
    for warning in &restored.warnings {
        warn!(kind = ?warning.kind, message = %warning.message, "Restore completed with warning");
    }
    info!(state = %restored.snapshot.run_state, active = restored.snapshot.config.active, "State restored");

    let (lifecycle, worker) = LifecycleHandle::spawn(manager);

    let server = ControlServer::bind_to(control_socket.clone())?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    spawn_control_listener(server, lifecycle.clone(), tokio::runtime::Handle::current(), shutdown_tx);

    tokio::select! {
        _ = shutdown_rx.recv() => info!("Shutdown requested"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, shutting down");
        }
    }

    if let Err(e) = lifecycle.shutdown().await {
        warn!(error = %e, "Lifecycle already stopped");
    }
    worker.await.context("Lifecycle worker panicked")?;

    // The listener thread is still blocked in accept; remove the socket ourselves
    let _ = std::fs::remove_file(&control_socket);
    info!("Daemon stopped");
    Ok(())
}

fn run_ctl(args: CtlArgs) -> Result<()> {
    let socket = match args.socket {
        Some(path) => path,
        None => ipc::default_control_socket()?,
    };
    let mut client = ControlClient::connect_to(&socket)?;

    let request = match args.command {
        CtlCommand::Status => ControlRequest::GetState,
        CtlCommand::Activate => ControlRequest::SetActive(true),
        CtlCommand::Deactivate => ControlRequest::SetActive(false),
        CtlCommand::Set { field, value } => ControlRequest::ChangeSetting { field, value },
        CtlCommand::RecheckPermission => ControlRequest::RecheckPermission,
        CtlCommand::Ping => ControlRequest::Ping,
        CtlCommand::Shutdown => ControlRequest::Shutdown,
        CtlCommand::Watch => {
            client.send_request(&ControlRequest::Subscribe)?;
            loop {
                // Ends with an error once the daemon closes the stream
                let response = client.recv_response()?;
                print_response(&response)?;
            }
        }
    };

    let response = client.request(request)?;
    print_response(&response)?;

    if let ControlResponse::Rejected { kind, message } = response {
        bail!("{kind:?}: {message}");
    }
    Ok(())
}

fn print_response(response: &ControlResponse) -> Result<()> {
    match response {
        ControlResponse::Pong => println!("pong"),
        ControlResponse::Ready => println!("ok"),
        other => println!(
            "{}",
            serde_json::to_string_pretty(other).context("Failed to format response")?
        ),
    }
    Ok(())
}
