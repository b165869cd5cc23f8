//! CLI Entry Point for motionlink
//!
//! Operates the devices declared in the configuration file:
//! - listing and validating them
//! - querying and moving stage axes
//! - opening and closing shutters
//!
//! # Usage
//!
//! ```bash
//! motionlink --config config/motionlink.toml devices
//! motionlink move stage_x --abs 20000
//! motionlink move focus --rel -500 --timeout-ms 5000
//! motionlink shutter shutter open
//! ```

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use link_protocol::{MotionKind, MotionPhase};
use motionlink::config::{LinkConfig, DEFAULT_CONFIG_PATH};
use motionlink::{logging, DeviceComponents, DriverRegistry, Shutter, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "motionlink")]
#[command(about = "Command/response control of serial motion controllers and shutters", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured devices and check their driver settings
    Devices,

    /// Print the position of a stage
    Position { device: String },

    /// Move a stage and wait for it to settle
    #[command(group(ArgGroup::new("target").required(true).args(["abs", "rel"])))]
    Move {
        device: String,

        /// Absolute target in device units
        #[arg(long, allow_hyphen_values = true)]
        abs: Option<i64>,

        /// Relative distance in device units
        #[arg(long, allow_hyphen_values = true)]
        rel: Option<i64>,

        /// Override the configured motion timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Home a stage
    Home {
        device: String,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Stop a stage
    Stop { device: String },

    /// Show the state of a stage or shutter
    Status { device: String },

    /// Open or close a shutter
    Shutter { device: String, state: ShutterState },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ShutterState {
    Open,
    Close,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LinkConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config)?;

    let registry = DriverRegistry::with_builtin();

    match cli.command {
        Commands::Devices => list_devices(&config, &registry),
        Commands::Position { device } => {
            let stage = open_stage(&config, &registry, &device).await?;
            println!("{}: {}", device, stage.position().await?);
            Ok(())
        }
        Commands::Move {
            device,
            abs,
            rel,
            timeout_ms,
        } => {
            let kind = match (abs, rel) {
                (Some(target), _) => MotionKind::Absolute(target),
                (None, Some(distance)) => MotionKind::Relative(distance),
                (None, None) => bail!("one of --abs or --rel is required"),
            };
            let stage = open_stage(&config, &registry, &device).await?;
            run_motion(&config, stage, &device, kind, timeout_ms).await
        }
        Commands::Home { device, timeout_ms } => {
            let stage = open_stage(&config, &registry, &device).await?;
            run_motion(&config, stage, &device, MotionKind::Home, timeout_ms).await
        }
        Commands::Stop { device } => {
            let stage = open_stage(&config, &registry, &device).await?;
            stage.halt().await?;
            println!("{}: stop sent", device);
            Ok(())
        }
        Commands::Status { device } => show_status(&config, &registry, &device).await,
        Commands::Shutter { device, state } => {
            let shutter = open_shutter(&config, &registry, &device).await?;
            let open = matches!(state, ShutterState::Open);
            shutter.set_open(open).await?;
            println!("{}: {}", device, if open { "open" } else { "closed" });
            Ok(())
        }
    }
}

fn list_devices(config: &LinkConfig, registry: &DriverRegistry) -> Result<()> {
    if config.devices.is_empty() {
        println!("No devices configured");
        return Ok(());
    }

    for device in &config.devices {
        let description = match registry.factory(&device.driver) {
            Some(factory) => format!("{} {:?}", factory.name(), factory.capabilities()),
            None => "unknown driver".to_string(),
        };
        let check = match registry.validate(&device.id, &device.driver, &device.config) {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("invalid: {:#}", e),
        };
        println!(
            "{:<16} {:<8} {:<9} {} ({})",
            device.id,
            device.driver,
            if device.enabled { "enabled" } else { "disabled" },
            description,
            check
        );
    }
    Ok(())
}

async fn open_device(config: &LinkConfig, registry: &DriverRegistry, id: &str) -> Result<DeviceComponents> {
    let Some(device) = config.device(id) else {
        bail!(
            "No device '{}' in configuration. Configured: {}",
            id,
            config
                .devices
                .iter()
                .map(|d| d.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    };
    if !device.enabled {
        bail!("Device '{}' is disabled", id);
    }

    registry
        .build(&device.id, &device.driver, device.config.clone(), config.driver_context())
        .await
}

async fn open_stage(config: &LinkConfig, registry: &DriverRegistry, id: &str) -> Result<Arc<dyn Stage>> {
    open_device(config, registry, id)
        .await?
        .stage
        .with_context(|| format!("Device '{}' is not a stage", id))
}

async fn open_shutter(config: &LinkConfig, registry: &DriverRegistry, id: &str) -> Result<Arc<dyn Shutter>> {
    open_device(config, registry, id)
        .await?
        .shutter
        .with_context(|| format!("Device '{}' is not a shutter", id))
}

async fn run_motion(
    config: &LinkConfig,
    stage: Arc<dyn Stage>,
    id: &str,
    kind: MotionKind,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let timeout = timeout_ms.map_or_else(|| config.motion_timeout(), Duration::from_millis);
    let slack = config.motion_config().poll_interval * 2;

    info!(device = id, ?kind, ?timeout, "Starting motion");
    stage.start_move(kind, timeout)?;

    tokio::select! {
        settled = stage.wait_settled(timeout + slack) => {
            match settled? {
                Some(position) => println!("{}: settled at {}", id, position),
                None => println!("{}: settled", id),
            }
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(device = id, "Interrupted, stopping motion");
            stage.stop().await?;
            if let Ok(Some(position)) = stage.wait_settled(config.motion_config().query_timeout).await {
                println!("{}: stopped at {}", id, position);
            }
            bail!("Motion interrupted")
        }
    }
}

async fn show_status(config: &LinkConfig, registry: &DriverRegistry, id: &str) -> Result<()> {
    let device = open_device(config, registry, id).await?;

    if let Some(stage) = device.stage {
        let phase = match stage.phase() {
            MotionPhase::Idle => "idle".to_string(),
            MotionPhase::InFlight(request) => format!("moving ({:?})", request.kind),
            MotionPhase::Completed => "completed".to_string(),
            MotionPhase::Failed(kind) => format!("failed ({})", kind),
        };
        match stage.position().await {
            Ok(position) => println!("{}: {}, position {}", id, phase, position),
            Err(e) => println!("{}: {}, position unavailable ({})", id, phase, e),
        }
    }

    if let Some(shutter) = device.shutter {
        let state = match shutter.is_open() {
            Some(true) => "open",
            Some(false) => "closed",
            None => "unknown",
        };
        let busy = if shutter.is_busy().await { "busy" } else { "idle" };
        println!("{}: shutter {}, {}", id, state, busy);
    }

    Ok(())
}
