use crate::action_mapper::{JointVector, JOINT_COUNT};
use crate::deploy_config::ArmPortConfig;
use crate::error::DeviceError;
use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, DeviceError>;

/// 1000 * 180 / pi, radians to 0.001 degree units
pub const MILLIDEGREES_PER_RADIAN: f64 = 57295.7795;
pub const GRIPPER_EFFORT: u16 = 1000;

const GRIPPER_DISABLE: u8 = 0x02;
const GRIPPER_ENABLE: u8 = 0x01;

/// Frames understood by the arm controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    Connect {
        can_port: String,
    },
    MasterSlaveConfig {
        linkage: u8,
        feedback_offset: u8,
        ctrl_offset: u8,
        linkage_offset: u8,
    },
    EnableArm {
        motor: u8,
        enable: u8,
    },
    GripperCtrl {
        position_um: i32,
        effort: u16,
        code: u8,
        set_zero: u8,
    },
    ModeCtrl {
        ctrl_mode: u8,
        move_mode: u8,
        speed_percent: u8,
        mit_mode: u8,
    },
    JointCtrl {
        millidegrees: [i32; JOINT_COUNT],
    },
    Disconnect,
}

impl BusCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BusCommand::Connect { .. } => "connect",
            BusCommand::MasterSlaveConfig { .. } => "master_slave_config",
            BusCommand::EnableArm { .. } => "enable_arm",
            BusCommand::GripperCtrl { .. } => "gripper_ctrl",
            BusCommand::ModeCtrl { .. } => "mode_ctrl",
            BusCommand::JointCtrl { .. } => "joint_ctrl",
            BusCommand::Disconnect => "disconnect",
        }
    }
}

/// Low level access to one arm's CAN interface
#[async_trait]
pub trait PiperBus: Send {
    async fn send(&mut self, command: &BusCommand) -> Result<()>;

    /// False when frames never reach an arm
    fn drives_hardware(&self) -> bool {
        true
    }
}

/// Logs and keeps every frame instead of touching hardware
#[derive(Debug, Default)]
pub struct RecordingBus {
    sent: Vec<BusCommand>,
    failing: Vec<&'static str>,
}

impl RecordingBus {
    pub fn new() -> Self {
        RecordingBus::default()
    }

    /// Reject every command with this name
    pub fn fail_on(mut self, command: &'static str) -> Self {
        self.failing.push(command);
        self
    }

    pub fn sent(&self) -> &[BusCommand] {
        &self.sent
    }
}

#[async_trait]
impl PiperBus for RecordingBus {
    async fn send(&mut self, command: &BusCommand) -> Result<()> {
        if self.failing.contains(&command.name()) {
            return Err(DeviceError::Bus {
                command: command.name(),
                message: "rejected by recording bus".to_owned(),
            });
        }
        info!("bus <- {:?}", command);
        self.sent.push(command.clone());
        Ok(())
    }

    fn drives_hardware(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HomingSettings {
    pub can_port: String,
    pub speed_percent: u8,
    /// Radians
    pub joint_target: JointVector,
    /// Meters
    pub gripper_target: f32,
    /// How long the arm gets to reach the target
    pub settle: Duration,
}

impl Default for HomingSettings {
    fn default() -> Self {
        HomingSettings {
            can_port: "can0".to_owned(),
            speed_percent: 30,
            joint_target: JointVector::zeros(),
            gripper_target: 0.0,
            settle: Duration::from_secs(10),
        }
    }
}

impl HomingSettings {
    pub fn for_arm(arm: &ArmPortConfig) -> Self {
        HomingSettings {
            can_port: arm.can_port.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingOutcome {
    Settled,
    Interrupted,
    /// Every frame was sent to a bus without an arm behind it
    Rehearsed,
}

pub fn joint_to_millidegrees(radians: f32) -> i32 {
    (f64::from(radians) * MILLIDEGREES_PER_RADIAN).round() as i32
}

pub fn gripper_to_micrometers(meters: f32) -> i32 {
    (f64::from(meters) * 1e6).round().abs() as i32
}

pub fn confirmation_accepted(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Drive one arm to `settings.joint_target` and wait for it to settle
///
/// `interrupt` only cuts the settle wait short. Once connected the bus is
/// always disconnected, also when a command fails.
pub async fn go_zero<B, F>(
    bus: &mut B,
    settings: &HomingSettings,
    interrupt: F,
) -> Result<HomingOutcome>
where
    B: PiperBus + ?Sized,
    F: Future<Output = ()>,
{
    info!("Connecting to {}", settings.can_port);
    bus.send(&BusCommand::Connect {
        can_port: settings.can_port.clone(),
    })
    .await?;
    sleep(Duration::from_millis(500)).await;

    let result = drive(bus, settings, interrupt).await;

    info!("Disconnecting");
    let disconnected = bus.send(&BusCommand::Disconnect).await;
    let outcome = result?;
    disconnected?;
    Ok(outcome)
}

async fn drive<B, F>(
    bus: &mut B,
    settings: &HomingSettings,
    interrupt: F,
) -> Result<HomingOutcome>
where
    B: PiperBus + ?Sized,
    F: Future<Output = ()>,
{
    info!("Enabling arm");
    bus.send(&BusCommand::MasterSlaveConfig {
        linkage: 0xFC,
        feedback_offset: 0,
        ctrl_offset: 0,
        linkage_offset: 0,
    })
    .await?;
    sleep(Duration::from_millis(200)).await;
    bus.send(&BusCommand::EnableArm {
        motor: 7,
        enable: 0x02,
    })
    .await?;
    sleep(Duration::from_millis(200)).await;

    info!("Enabling gripper");
    match enable_gripper(bus).await {
        Ok(()) => info!("Gripper enabled"),
        Err(error) => warn!("Gripper enable failed, continuing: {}", error),
    }

    let millidegrees = {
        let mut values = [0; JOINT_COUNT];
        for (value, radians) in values.iter_mut().zip(settings.joint_target.iter()) {
            *value = joint_to_millidegrees(*radians);
        }
        values
    };
    info!(
        "Moving to {:.2?} deg at {}% speed",
        settings.joint_target.map(f32::to_degrees).as_slice(),
        settings.speed_percent
    );
    bus.send(&BusCommand::ModeCtrl {
        ctrl_mode: 0x01,
        move_mode: 0x01,
        speed_percent: settings.speed_percent,
        mit_mode: 0x00,
    })
    .await?;
    sleep(Duration::from_millis(100)).await;
    bus.send(&BusCommand::JointCtrl { millidegrees }).await?;
    sleep(Duration::from_millis(100)).await;
    bus.send(&BusCommand::GripperCtrl {
        position_um: gripper_to_micrometers(settings.gripper_target),
        effort: GRIPPER_EFFORT,
        code: GRIPPER_ENABLE,
        set_zero: 0,
    })
    .await?;

    if !bus.drives_hardware() {
        warn!("No arm behind {}, nothing moved", settings.can_port);
        return Ok(HomingOutcome::Rehearsed);
    }
    info!(
        "Command sent, waiting {:?} for the arm to settle (Ctrl+C to stop)",
        settings.settle
    );
    let outcome = tokio::select! {
        _ = sleep(settings.settle) => HomingOutcome::Settled,
        _ = interrupt => HomingOutcome::Interrupted,
    };
    match outcome {
        HomingOutcome::Settled => info!("Arm settled"),
        HomingOutcome::Interrupted => warn!("Interrupted while settling"),
        HomingOutcome::Rehearsed => {}
    }
    Ok(outcome)
}

async fn enable_gripper<B: PiperBus + ?Sized>(bus: &mut B) -> Result<()> {
    bus.send(&BusCommand::GripperCtrl {
        position_um: 0,
        effort: GRIPPER_EFFORT,
        code: GRIPPER_DISABLE,
        set_zero: 0,
    })
    .await?;
    sleep(Duration::from_millis(100)).await;
    bus.send(&BusCommand::GripperCtrl {
        position_um: 0,
        effort: GRIPPER_EFFORT,
        code: GRIPPER_ENABLE,
        set_zero: 0,
    })
    .await?;
    sleep(Duration::from_millis(200)).await;
    Ok(())
}
