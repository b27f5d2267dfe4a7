use bt_audio_manager::config::AppConfig;
use bt_audio_manager::errors;
use bt_audio_manager::events::{EventBus, LogRing, RingLogger};
use bt_audio_manager::manager::Manager;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser)]
#[command(name = "bt-audio-manager", about = "Bluetooth audio device manager daemon for Linux")]
struct Args {
    #[arg(long, default_value = "/data", help = "State directory (device store, options.json)")]
    data_dir: PathBuf,
    #[arg(long, default_value = "/config", help = "Settings directory (survives reinstalls)")]
    config_dir: PathBuf,
    #[arg(long, help = "PulseAudio server address (skips socket probing)")]
    pulse_server: Option<String>,
    #[arg(long, short = 'd', help = "Enable debug logging")]
    debug: bool,
    #[arg(long, short = 'v', help = "Show version and exit")]
    version: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        println!("bt-audio-manager {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = AppConfig::load(&args.data_dir, &args.config_dir, args.pulse_server.clone());

    let level = if args.debug { "debug" } else { &config.log_level };
    let events = EventBus::new();
    let inner_logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).build();
    // Tee: records reach stdout via env_logger and the UI through the
    // log ring + event bus.
    let log_ring = RingLogger::install(inner_logger, events.clone());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, events, log_ring)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig, events: EventBus, log_ring: LogRing) -> errors::Result<()> {
    info!("bt-audio-manager v{} starting...", env!("CARGO_PKG_VERSION"));

    let manager = Manager::start(config, events, log_ring).await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    info!("All services running. Waiting for shutdown signal...");
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    manager.shutdown().await;
    info!("Goodbye.");
    Ok(())
}
