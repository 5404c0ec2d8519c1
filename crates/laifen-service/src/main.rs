//! laifend - Laifen toothbrush daemon.
//!
//! Run with: `cargo run -p laifen-service`

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

use laifen_core::scan::{self, ScanOptions};
use laifen_core::{Command as DeviceCommand, DeviceIdentity, Link};
use laifen_service::{Config, Daemon, default_config_path};
use laifen_store::Store;

/// laifend - keeps a live session with every Laifen toothbrush in range.
#[derive(Parser, Debug)]
#[command(name = "laifend")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground (default behavior).
    Run,

    /// List toothbrushes in range.
    Scan {
        /// Scan duration in seconds.
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,

        /// Show every BLE device, not just toothbrushes.
        #[arg(long)]
        all: bool,
    },

    /// Print the last known state of every device.
    Show,

    /// Turn a toothbrush on or off.
    Power {
        /// Desired motor state.
        state: PowerState,

        /// Device address (peripheral UUID on macOS).
        address: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PowerState {
    On,
    Off,
}

impl From<PowerState> for DeviceCommand {
    fn from(state: PowerState) -> Self {
        match state {
            PowerState::On => DeviceCommand::TurnOn,
            PowerState::Off => DeviceCommand::TurnOff,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }
    config.validate()?;

    match args.command {
        Some(Command::Scan { timeout, all }) => scan_devices(timeout, all).await,
        Some(Command::Show) => show_snapshots(&config),
        Some(Command::Power { state, address }) => power(&config, state, &address).await,
        Some(Command::Run) | None => run_daemon(config).await,
    }
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("laifend={}", level).parse()?)
                .add_directive(format!("laifen_service={}", level).parse()?)
                .add_directive(format!("laifen_core={}", level).parse()?),
        )
        .init();
    Ok(())
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    if config.devices.is_empty() {
        info!(
            "No devices configured in {:?}, adopting every toothbrush seen",
            default_config_path()
        );
    }

    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;

    Daemon::new(config, store).run().await
}

async fn scan_devices(seconds: u64, all: bool) -> anyhow::Result<()> {
    let mut options = ScanOptions::default().duration(Duration::from_secs(seconds));
    if all {
        options = options.all_devices();
    }

    let devices = scan::scan_for_devices(options).await?;
    if devices.is_empty() {
        println!("No toothbrushes found");
        return Ok(());
    }

    println!("{:<40} {:<24} {:>6}", "ADDRESS", "NAME", "RSSI");
    for device in devices {
        println!(
            "{:<40} {:<24} {:>6}",
            device.identity,
            device.name.as_deref().unwrap_or("-"),
            device.rssi.map_or_else(|| "-".to_string(), |r| r.to_string()),
        );
    }
    Ok(())
}

fn show_snapshots(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(&config.storage.path)?;
    let snapshots = store.list_snapshots()?;
    if snapshots.is_empty() {
        println!("No stored state yet");
        return Ok(());
    }

    for snapshot in snapshots {
        let identity = DeviceIdentity::new(&snapshot.device_id);
        let telemetry = &snapshot.telemetry;
        println!(
            "{} ({})",
            identity,
            config.alias_of(&identity).unwrap_or("no alias")
        );
        println!("  status      {}", telemetry.status);
        println!("  mode        {}", telemetry.mode);
        println!(
            "  motor       vibration {} / range {} / speed {}",
            telemetry.vibration_strength, telemetry.oscillation_range, telemetry.oscillation_speed
        );
        println!("  battery     {}%", telemetry.battery_level);
        println!("  brushing    {:.1} min", telemetry.brushing_time());
        println!("  updated     {}", snapshot.updated_at);
    }
    Ok(())
}

async fn power(config: &Config, state: PowerState, address: &str) -> anyhow::Result<()> {
    let identity = DeviceIdentity::new(address);
    let command = DeviceCommand::from(state);
    let link_config = config.link.to_link_config();

    let adapter = scan::get_adapter().await?;
    let device = timeout(
        link_config.connect_timeout,
        scan::find_device(&adapter, &identity),
    )
    .await
    .map_err(|_| anyhow::anyhow!("timed out looking for {}", identity))??;

    let mut link = Link::new(
        identity.clone(),
        Box::new(device.into_transport(adapter)),
        link_config,
    );
    if !link.connect().await {
        anyhow::bail!("could not connect to {} (is it awake?)", identity);
    }

    let sent = link.send(&command.encode()).await;
    link.disconnect().await;

    if sent {
        println!("Sent '{}' to {}", command, identity);
        Ok(())
    } else {
        anyhow::bail!("failed to send '{}' to {}", command, identity)
    }
}
