//! tf-scheduler
//!
//! Runs the command scheduler against simulated devices and a simulated
//! invocation executor.
//!
//! ## Usage
//!
//! - `--device SERIAL` registers a physical device (repeatable)
//! - `--cmdfile PATH` loads a command file, `--reload` watches it
//! - trailing arguments are queued as one more command

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tf_scheduler::{
    CommandScheduler, Device, DevicePool, LogFormat, SchedulerConfig, SimulatedInvocation,
};

#[derive(Debug, Parser)]
#[command(name = "tf-scheduler", about = "Schedule test commands onto devices")]
struct Cli {
    /// Register a physical device with this serial (repeatable).
    #[arg(long = "device", value_name = "SERIAL")]
    devices: Vec<String>,

    /// Register an emulator with this serial (repeatable).
    #[arg(long = "emulator", value_name = "SERIAL")]
    emulators: Vec<String>,

    /// Register an adb-over-tcp placeholder device (repeatable).
    #[arg(long = "tcp-device", value_name = "SERIAL")]
    tcp_devices: Vec<String>,

    /// Number of stub devices to register.
    #[arg(long, default_value_t = 0)]
    null_devices: usize,

    /// Load commands from this file (repeatable).
    #[arg(long = "cmdfile", value_name = "PATH")]
    command_files: Vec<PathBuf>,

    /// Reload command files when they change.
    #[arg(long, env = "TF_COMMAND_FILE_RELOAD")]
    reload: bool,

    /// Stop once every command has run.
    #[arg(long)]
    exit_on_empty: bool,

    /// How long each simulated invocation takes, in milliseconds.
    #[arg(long, env = "TF_SIM_INVOCATION_MS", default_value_t = 1000)]
    invocation_ms: u64,

    /// Command to queue, e.g. `test --serial serial0 --loop`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SchedulerConfig::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
    }

    info!("Starting tf-scheduler");
    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        dump_dir = %config.dump_dir.display(),
        "Configuration loaded"
    );

    // Register simulated devices
    let pool = DevicePool::new();
    let devices = cli
        .devices
        .iter()
        .map(|serial| Device::physical(serial.as_str()))
        .chain(cli.emulators.iter().map(|serial| Device::emulator(serial.as_str())))
        .chain(cli.tcp_devices.iter().map(|serial| Device::tcp(serial.as_str())))
        .chain((0..cli.null_devices).map(|i| Device::null_device(format!("null-device-{i}"))));
    for device in devices {
        pool.register(device)?;
    }

    let invocation = Arc::new(SimulatedInvocation::new(Duration::from_millis(
        cli.invocation_ms,
    )));
    let scheduler = CommandScheduler::new(config, Arc::new(pool), invocation);
    scheduler.set_command_file_reload(cli.reload);

    for path in &cli.command_files {
        let added = scheduler
            .add_command_file(path, &[])
            .with_context(|| format!("failed to load command file {}", path.display()))?;
        info!(path = %path.display(), added, "Command file loaded");
    }
    if !cli.command.is_empty() {
        scheduler.add_command(&cli.command)?;
    }

    scheduler.start()?;
    if cli.exit_on_empty {
        scheduler.shutdown_on_empty();
    }

    // Wait for shutdown signal
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
            scheduler.shutdown();
            if !scheduler.join_timeout(Duration::from_secs(10)).await {
                warn!("Invocations still running, stopping them");
                scheduler.shutdown_hard();
                scheduler.join().await;
            }
        }
        _ = scheduler.join() => {
            info!("Command queue drained");
        }
    }

    if let Some(e) = scheduler.last_invocation_error() {
        warn!(error = %e, "Last invocation error");
    }
    info!("tf-scheduler shutdown complete");
    Ok(())
}
