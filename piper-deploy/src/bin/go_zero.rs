use anyhow::{Context, Result};
use async_std::io;
use clap::{Parser, ValueEnum};
use nalgebra as na;
use piper_deploy::logging;
use piper_pipeline::{
    deploy_config::DeployConfig,
    homing::{
        confirmation_accepted, go_zero, HomingOutcome, HomingSettings, PiperBus, RecordingBus,
    },
};
use std::{path::PathBuf, time::Duration};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// Logs every frame, no arm is attached
    Recording,
}

/// Move one arm to its zero position
#[derive(Parser)]
#[command(author, version)]
struct Args {
    /// Where the CAN frames go
    #[arg(long, value_enum)]
    backend: Backend,

    /// Arm name from the deploy config
    #[arg(long, default_value = "right_arm")]
    arm: String,

    /// Overrides the CAN port from the deploy config
    #[arg(long)]
    can_port: Option<String>,

    /// Speed in percent of maximum
    #[arg(long, default_value_t = 30)]
    speed: u8,

    /// Joint targets in degrees
    #[arg(long, num_args = 6, allow_negative_numbers = true)]
    target_deg: Option<Vec<f32>>,

    /// Gripper opening in meters
    #[arg(long, default_value_t = 0.0)]
    gripper: f32,

    #[arg(long, default_value_t = 10.0)]
    settle_secs: f32,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,

    /// JSON or YAML deploy config, defaults to the included one
    #[arg(long)]
    deploy_config: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

async fn confirm(can_port: &str) -> Result<bool> {
    println!("This will move the arm on {} to its target position.", can_port);
    println!("Make sure the workspace is clear and the emergency stop is within reach.");
    println!("Continue? (yes/no)");
    let stdin = io::stdin();
    let mut line = String::new();
    stdin.read_line(&mut line).await?;
    Ok(confirmation_accepted(&line))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbose);

    let config = match &args.deploy_config {
        Some(path) => DeployConfig::load(path)
            .with_context(|| format!("Failed to load deploy config {:?}", path))?,
        None => DeployConfig::included(),
    };
    let mut settings = match config.arm(&args.arm) {
        Some(arm) => HomingSettings::for_arm(arm),
        None => anyhow::bail!("Unknown arm {}", args.arm),
    };
    if let Some(can_port) = args.can_port {
        settings.can_port = can_port;
    }
    settings.speed_percent = args.speed.clamp(1, 100);
    if let Some(target) = &args.target_deg {
        let radians = target.iter().map(|deg| deg.to_radians());
        settings.joint_target = na::Vector6::from_iterator(radians);
    }
    settings.gripper_target = args.gripper;
    settings.settle = Duration::from_secs_f32(args.settle_secs.max(0.0));

    let mut bus: Box<dyn PiperBus> = match args.backend {
        Backend::Recording => Box::new(RecordingBus::new()),
    };
    let needs_confirmation = bus.drives_hardware() && !args.yes;
    if needs_confirmation && !confirm(&settings.can_port).await? {
        info!("Cancelled");
        return Ok(());
    }

    match go_zero(bus.as_mut(), &settings, piper_deploy::ctrl_c()).await? {
        HomingOutcome::Settled => info!("{} reached its target", args.arm),
        HomingOutcome::Interrupted => info!("Stopped by user"),
        HomingOutcome::Rehearsed => warn!("Rehearsal only, no arm was moved"),
    }
    Ok(())
}
