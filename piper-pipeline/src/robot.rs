use crate::action_mapper::{ArmCommand, ArmSide, JointVector, MoveCommand};
use crate::deploy_config::DeployConfig;
use crate::error::DeviceError;
use crate::observation::{ArmReading, CameraFrame, Pixels, RawObservation};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

type Result<T> = std::result::Result<T, DeviceError>;

/// Arm controllers plus camera sensors of one robot
#[async_trait]
pub trait Robot: Send {
    async fn set_up(&mut self) -> Result<()>;
    /// Send both arms to their start pose
    async fn reset(&mut self) -> Result<()>;
    async fn get(&mut self) -> Result<RawObservation>;
    async fn move_arms(&mut self, command: &MoveCommand) -> Result<()>;
}

#[async_trait]
impl<T: Robot + ?Sized> Robot for Box<T> {
    async fn set_up(&mut self) -> Result<()> {
        (**self).set_up().await
    }

    async fn reset(&mut self) -> Result<()> {
        (**self).reset().await
    }

    async fn get(&mut self) -> Result<RawObservation> {
        (**self).get().await
    }

    async fn move_arms(&mut self, command: &MoveCommand) -> Result<()> {
        (**self).move_arms(command).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub set_up: usize,
    pub reset: usize,
    pub get: usize,
    pub move_arms: usize,
}

/// In process stand in for the dual arm rig
///
/// Arms reach their targets instantly and every camera produces a gradient
/// frame so letterboxing is visible in saved debug images.
#[derive(Debug)]
pub struct SimulatedRobot {
    cameras: Vec<String>,
    start_positions: BTreeMap<ArmSide, JointVector>,
    frame_height: usize,
    frame_width: usize,
    arms: BTreeMap<ArmSide, ArmCommand>,
    connected: bool,
    calls: CallCounts,
    last_command: Option<MoveCommand>,
}

impl SimulatedRobot {
    pub fn new(config: &DeployConfig) -> Self {
        let start_positions = ArmSide::BOTH
            .iter()
            .map(|side| {
                let start = config
                    .arm(side.name())
                    .map(|arm| JointVector::from(arm.start_position_deg).map(f32::to_radians))
                    .unwrap_or_else(JointVector::zeros);
                (*side, start)
            })
            .collect::<BTreeMap<_, _>>();
        let arms = start_positions
            .iter()
            .map(|(side, joint)| (*side, ArmCommand::new(*joint, 0.0)))
            .collect();
        SimulatedRobot {
            cameras: config.cameras.iter().map(|c| c.source.clone()).collect(),
            start_positions,
            frame_height: 480,
            frame_width: 640,
            arms,
            connected: false,
            calls: CallCounts::default(),
            last_command: None,
        }
    }

    pub fn with_frame_size(mut self, height: usize, width: usize) -> Self {
        self.frame_height = height;
        self.frame_width = width;
        self
    }

    pub fn calls(&self) -> CallCounts {
        self.calls
    }

    pub fn last_command(&self) -> Option<&MoveCommand> {
        self.last_command.as_ref()
    }

    pub fn arm(&self, side: ArmSide) -> Option<&ArmCommand> {
        self.arms.get(&side)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(DeviceError::Connection {
                device: "simulated robot".to_owned(),
                message: "set_up was not called".to_owned(),
            })
        }
    }

    fn gradient_frame(&self, tint: u8) -> CameraFrame {
        let (height, width) = (self.frame_height, self.frame_width);
        let mut data = Vec::with_capacity(height * width * 3);
        for y in 0..height {
            for x in 0..width {
                data.push((x * 255 / width.max(1)) as u8);
                data.push((y * 255 / height.max(1)) as u8);
                data.push(tint);
            }
        }
        CameraFrame::new(vec![height, width, 3], Pixels::U8(data))
    }
}

#[async_trait]
impl Robot for SimulatedRobot {
    async fn set_up(&mut self) -> Result<()> {
        self.calls.set_up += 1;
        self.connected = true;
        debug!("simulated robot with cameras {:?}", self.cameras);
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.calls.reset += 1;
        self.ensure_connected()?;
        for (side, start) in &self.start_positions {
            self.arms.insert(*side, ArmCommand::new(*start, 0.0));
        }
        Ok(())
    }

    async fn get(&mut self) -> Result<RawObservation> {
        self.calls.get += 1;
        self.ensure_connected()?;
        let mut observation = RawObservation::new();
        for (side, arm) in &self.arms {
            observation = observation.with_arm(
                side.name(),
                ArmReading::new(arm.joint.iter().copied().collect(), arm.gripper),
            );
        }
        for (index, camera) in self.cameras.iter().enumerate() {
            let tint = (64 * (index + 1)).min(255) as u8;
            observation = observation.with_camera(camera, Some(self.gradient_frame(tint)));
        }
        Ok(observation)
    }

    async fn move_arms(&mut self, command: &MoveCommand) -> Result<()> {
        self.calls.move_arms += 1;
        self.ensure_connected()?;
        for (side, arm) in command.arms() {
            self.arms.insert(side, arm.clone());
        }
        self.last_command = Some(command.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::ObservationNormalizer;

    #[tokio::test]
    async fn get_requires_set_up() {
        let mut robot = SimulatedRobot::new(&DeployConfig::included());
        assert!(matches!(
            robot.get().await,
            Err(DeviceError::Connection { .. })
        ));
        robot.set_up().await.unwrap();
        assert!(robot.get().await.is_ok());
        assert_eq!(robot.calls().get, 2);
    }

    #[tokio::test]
    async fn observation_passes_validation() {
        let mut robot = SimulatedRobot::new(&DeployConfig::included()).with_frame_size(48, 64);
        robot.set_up().await.unwrap();
        let raw = robot.get().await.unwrap();
        assert_eq!(raw.camera_shapes()["cam_head"], Some(vec![48, 64, 3]));
        let normalizer = ObservationNormalizer::new(DeployConfig::included().normalizer_config());
        assert!(normalizer.validate(&raw).is_empty());
    }

    #[tokio::test]
    async fn move_then_reset() {
        let mut config = DeployConfig::included();
        config.arms[0].start_position_deg = [90.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut robot = SimulatedRobot::new(&config);
        robot.set_up().await.unwrap();
        let command = MoveCommand {
            left_arm: ArmCommand::new(JointVector::repeat(0.1), 0.5),
            right_arm: ArmCommand::new(JointVector::repeat(-0.1), 0.2),
        };
        robot.move_arms(&command).await.unwrap();
        assert_eq!(robot.arm(ArmSide::Right), Some(&command.right_arm));
        assert_eq!(robot.last_command(), Some(&command));

        robot.reset().await.unwrap();
        let left = robot.arm(ArmSide::Left).unwrap();
        approx::assert_relative_eq!(left.joint[0], std::f32::consts::FRAC_PI_2);
        approx::assert_relative_eq!(left.gripper, 0.0);
        assert_eq!(
            robot.calls(),
            CallCounts {
                set_up: 1,
                reset: 1,
                get: 0,
                move_arms: 1
            }
        );
    }
}
