//! CLI entry point for hv-bias.
//!
//! Run every configured supply:
//! ```bash
//! hv-bias run --config hv.toml
//! ```
//!
//! List serial ports:
//! ```bash
//! hv-bias ports
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hv_control::DeviceController;
use hv_core::events::{event_channel, DeviceEvent};
use hv_core::HvSettings;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hv-bias")]
#[command(about = "Ramp-controlled bias for Keithley high-voltage supplies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured supplies and run their poll loops
    Run {
        /// Settings file (TOML)
        #[arg(long, short)]
        config: PathBuf,

        /// Attach to supplies that are already biased, overriding the file
        #[arg(long)]
        hot_start: bool,
    },

    /// List serial ports visible to this machine
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, hot_start } => run(config, hot_start).await,
        Commands::Ports => {
            init_tracing("info");
            list_ports()
        }
    }
}

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

async fn run(config_path: PathBuf, hot_start: bool) -> Result<()> {
    let settings = HvSettings::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_tracing(&settings.application.log_level);
    tracing::info!(
        app = %settings.application.name,
        devices = settings.devices.len(),
        "starting"
    );

    let (events, mut rx) = event_channel();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(DeviceEvent::Log(record)) => println!("{record}"),
                Ok(DeviceEvent::DayChanged { device, date }) => {
                    tracing::info!(%device, %date, "new log day");
                }
                Ok(DeviceEvent::Renamed { device, name }) => {
                    tracing::info!(%device, %name, "new log name");
                }
                Ok(DeviceEvent::Halted { device, reason }) => {
                    tracing::error!(%device, %reason, "device halted");
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut controllers = Vec::new();
    let mut loops = Vec::new();
    for mut device in settings.devices.clone() {
        device.hot_start |= hot_start;
        let id = device.id.clone();
        match DeviceController::connect(device, &settings.timing, events.clone()).await {
            Ok(controller) => {
                loops.push((id, controller.spawn()));
                controllers.push(controller);
            }
            Err(e) => tracing::error!(device = %id, error = %e, "device not started"),
        }
    }
    drop(events);

    if controllers.is_empty() {
        anyhow::bail!("no device could be started");
    }
    println!("Running {} device(s), Ctrl+C to stop", controllers.len());

    signal::ctrl_c().await.context("installing Ctrl+C handler")?;
    println!("Shutdown requested, outputs are left as they are");

    for controller in &controllers {
        controller.kill();
    }
    for (id, handle) in loops {
        match handle.await {
            Ok(Ok(())) => tracing::info!(device = %id, "stopped"),
            Ok(Err(e)) => tracing::warn!(device = %id, error = %e, "had halted"),
            Err(e) => tracing::error!(device = %id, error = %e, "poll task panicked"),
        }
    }
    drop(controllers);
    printer.await.context("event printer")?;
    Ok(())
}
