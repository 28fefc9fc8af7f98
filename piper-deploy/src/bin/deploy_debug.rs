use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use piper_deploy::logging;
use piper_pipeline::{
    action_mapper::{ActionMapper, ActionMode},
    deploy_config::DeployConfig,
    frame_sink::PngFrameSink,
    observation::ObservationNormalizer,
    policy::load_policy,
    robot::SimulatedRobot,
    step_driver::{DriverSettings, RunOutcome, StepDriver},
};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// In process dual arm stand in
    Simulated,
}

/// Run a policy on the dual arm rig for a few steps and log every stage
#[derive(Parser)]
#[command(author, version)]
struct Args {
    /// Checkpoint directory the policy is loaded from
    #[arg(long, default_value = ".")]
    checkpoint: PathBuf,

    /// Policy configuration name from the deploy config
    #[arg(long, default_value = "pi05_ygx")]
    config_name: String,

    /// Language instruction passed to the policy
    #[arg(long)]
    task: Option<String>,

    /// Compute actions without moving the arms
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value_t = 3)]
    max_step: usize,

    /// Save normalized camera frames as PNG
    #[arg(long)]
    save_images: bool,

    /// Interpret actions as absolute targets or as deltas on the current state
    #[arg(long, default_value = "absolute")]
    action_mode: ActionMode,

    /// JSON or YAML deploy config, defaults to the included one
    #[arg(long)]
    deploy_config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "simulated")]
    backend: Backend,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
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
    let limits = config.joint_limits()?;

    let policy_spec = config.policy(&args.config_name)?;
    info!(
        "Loading policy {} ({:?}) from {:?}",
        args.config_name, policy_spec, args.checkpoint
    );
    let policy = load_policy(policy_spec, &args.checkpoint)?;

    let robot = match args.backend {
        Backend::Simulated => SimulatedRobot::new(&config),
    };
    if args.dry_run {
        warn!("Dry run, arms will not move");
    }

    let settings = DriverSettings {
        max_steps: args.max_step,
        dry_run: args.dry_run,
        action_mode: args.action_mode,
        step_delay: config.driver.step_delay(),
        task: args.task,
    };
    let mut driver = StepDriver::new(
        robot,
        policy,
        ObservationNormalizer::new(config.normalizer_config()),
        ActionMapper::new(limits),
        settings,
    );
    if args.save_images {
        info!("Saving frames to {:?}", config.driver.debug_image_dir);
        driver = driver.with_frame_sink(Box::new(PngFrameSink::new(
            config.driver.debug_image_dir.clone(),
        )));
    }

    let report = driver.run_until(piper_deploy::ctrl_c()).await;

    for trace in &report.steps {
        info!(
            "step {}: issues={} clamped={} skipped={} moved={} frames={}",
            trace.step + 1,
            trace.issues.len(),
            trace
                .mapped
                .as_ref()
                .map_or(0, |mapped| mapped.clamped().count()),
            trace.skipped.is_some(),
            trace.actuated,
            trace.saved_frames.len()
        );
    }

    if let Some(Err(cleanup)) = &report.cleanup {
        error!("Final reset failed: {}", cleanup);
    }

    match report.outcome {
        RunOutcome::Completed { steps } => {
            info!("Done after {} steps", steps);
            Ok(())
        }
        RunOutcome::Interrupted { steps } => {
            info!("Stopped by user after {} steps", steps);
            Ok(())
        }
        RunOutcome::Aborted { step, stage, error } => Err(anyhow::Error::new(error)
            .context(format!("Run aborted in step {} at {}", step + 1, stage))),
    }
}
