use crate::error::MalformedActionError;
use crate::observation::StateVector;
use crate::policy::ActionChunk;
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::{fmt, ops::RangeInclusive, str::FromStr};
use thiserror::Error;

pub const JOINT_COUNT: usize = 6;
/// Values consumed from each action frame, 6 joints and a gripper per arm
pub const ACTION_DIM: usize = 2 * (JOINT_COUNT + 1);

pub type JointVector = na::Vector6<f32>;

const DEFAULT_LIMITS_DEG: [(f32, f32); JOINT_COUNT] = [
    (-150.0, 150.0),
    (0.0, 180.0),
    (-170.0, 0.0),
    (-100.0, 100.0),
    (-70.0, 70.0),
    (-120.0, 120.0),
];

/// Mechanical range of each joint in radians, shared by both arms
#[derive(Debug, Clone, PartialEq)]
pub struct JointLimits {
    ranges: [RangeInclusive<f32>; JOINT_COUNT],
}

impl JointLimits {
    pub fn new(ranges: [RangeInclusive<f32>; JOINT_COUNT]) -> Self {
        JointLimits { ranges }
    }

    pub fn from_degrees(degrees: [(f32, f32); JOINT_COUNT]) -> Self {
        let ranges = degrees.map(|(min, max)| min.to_radians()..=max.to_radians());
        JointLimits { ranges }
    }

    pub fn range(&self, joint: usize) -> &RangeInclusive<f32> {
        &self.ranges[joint]
    }

    pub fn clamp(&self, joint: usize, angle: f32) -> f32 {
        let range = &self.ranges[joint];
        angle.clamp(*range.start(), *range.end())
    }
}

impl Default for JointLimits {
    fn default() -> Self {
        JointLimits::from_degrees(DEFAULT_LIMITS_DEG)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    /// Action values are joint targets
    #[default]
    Absolute,
    /// Action values are added to the current joint state
    Delta,
}

#[derive(Error, Debug)]
#[error("unknown action mode {0}, expected delta or absolute")]
pub struct ParseActionModeError(String);

impl FromStr for ActionMode {
    type Err = ParseActionModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absolute" => Ok(ActionMode::Absolute),
            "delta" => Ok(ActionMode::Delta),
            other => Err(ParseActionModeError(other.to_owned())),
        }
    }
}

impl fmt::Display for ActionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionMode::Absolute => write!(f, "absolute"),
            ActionMode::Delta => write!(f, "delta"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArmSide {
    Left,
    Right,
}

impl ArmSide {
    pub const BOTH: [ArmSide; 2] = [ArmSide::Left, ArmSide::Right];

    pub fn name(&self) -> &'static str {
        match self {
            ArmSide::Left => "left_arm",
            ArmSide::Right => "right_arm",
        }
    }

    /// Index of the first joint of this arm in state and action vectors
    pub fn offset(&self) -> usize {
        match self {
            ArmSide::Left => 0,
            ArmSide::Right => JOINT_COUNT + 1,
        }
    }

    pub fn gripper_index(&self) -> usize {
        self.offset() + JOINT_COUNT
    }
}

impl fmt::Display for ArmSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArmCommand {
    /// Joint targets in radians
    pub joint: JointVector,
    pub gripper: f32,
}

impl ArmCommand {
    pub fn new(joint: JointVector, gripper: f32) -> ArmCommand {
        ArmCommand { joint, gripper }
    }

    pub fn joint_degrees(&self) -> JointVector {
        self.joint.map(|angle| angle.to_degrees())
    }
}

/// The only thing handed to the actuators
#[derive(Debug, Clone, PartialEq)]
pub struct MoveCommand {
    pub left_arm: ArmCommand,
    pub right_arm: ArmCommand,
}

impl MoveCommand {
    pub fn arm(&self, side: ArmSide) -> &ArmCommand {
        match side {
            ArmSide::Left => &self.left_arm,
            ArmSide::Right => &self.right_arm,
        }
    }

    pub fn arms(&self) -> impl Iterator<Item = (ArmSide, &ArmCommand)> {
        ArmSide::BOTH.into_iter().map(move |side| (side, self.arm(side)))
    }
}

/// Audit entry for one joint passing through the limiter
#[derive(Debug, Clone, PartialEq)]
pub struct ClampRecord {
    pub arm: ArmSide,
    pub joint: usize,
    pub requested: f32,
    pub applied: f32,
    pub limit: RangeInclusive<f32>,
}

impl ClampRecord {
    pub fn was_clamped(&self) -> bool {
        #[allow(clippy::float_cmp)]
        let unchanged = self.requested == self.applied;
        !unchanged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedAction {
    /// Targets before the limiter
    pub requested: MoveCommand,
    pub command: MoveCommand,
    pub clamps: Vec<ClampRecord>,
}

impl MappedAction {
    pub fn clamped(&self) -> impl Iterator<Item = &ClampRecord> {
        self.clamps.iter().filter(|record| record.was_clamped())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionMapper {
    limits: JointLimits,
}

impl ActionMapper {
    pub fn new(limits: JointLimits) -> Self {
        ActionMapper { limits }
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    /// Map the first frame of a chunk
    pub fn map_chunk(
        &self,
        chunk: &ActionChunk,
        state: &StateVector,
        mode: ActionMode,
    ) -> Result<MappedAction, MalformedActionError> {
        let frame = chunk.first_frame().ok_or(MalformedActionError::EmptyChunk)?;
        self.map_action(frame, state, mode)
    }

    pub fn map_action(
        &self,
        action: &[f32],
        state: &StateVector,
        mode: ActionMode,
    ) -> Result<MappedAction, MalformedActionError> {
        if action.len() < ACTION_DIM {
            return Err(MalformedActionError::TooShort {
                len: action.len(),
                required: ACTION_DIM,
            });
        }
        let selected = &action[..ACTION_DIM];
        if let Some(index) = selected.iter().position(|value| !value.is_finite()) {
            return Err(MalformedActionError::NonFinite { index });
        }

        let requested = MoveCommand {
            left_arm: requested_arm(selected, state, ArmSide::Left, mode)?,
            right_arm: requested_arm(selected, state, ArmSide::Right, mode)?,
        };

        let mut clamps = Vec::with_capacity(2 * JOINT_COUNT);
        let command = MoveCommand {
            left_arm: self.clamp_arm(ArmSide::Left, &requested.left_arm, &mut clamps),
            right_arm: self.clamp_arm(ArmSide::Right, &requested.right_arm, &mut clamps),
        };
        Ok(MappedAction {
            requested,
            command,
            clamps,
        })
    }

    fn clamp_arm(
        &self,
        side: ArmSide,
        requested: &ArmCommand,
        clamps: &mut Vec<ClampRecord>,
    ) -> ArmCommand {
        let mut joint = requested.joint;
        for (index, angle) in joint.iter_mut().enumerate() {
            let applied = self.limits.clamp(index, *angle);
            clamps.push(ClampRecord {
                arm: side,
                joint: index,
                requested: *angle,
                applied,
                limit: self.limits.range(index).clone(),
            });
            *angle = applied;
        }
        // gripper is not limited here
        ArmCommand::new(joint, requested.gripper)
    }
}

fn requested_arm(
    action: &[f32],
    state: &StateVector,
    side: ArmSide,
    mode: ActionMode,
) -> Result<ArmCommand, MalformedActionError> {
    let offset = side.offset();
    let mut joint = JointVector::from_column_slice(&action[offset..offset + JOINT_COUNT]);
    if mode == ActionMode::Delta {
        joint += state.fixed_rows::<JOINT_COUNT>(offset);
    }
    if let Some(index) = joint.iter().position(|angle| !angle.is_finite()) {
        return Err(MalformedActionError::NonFinite {
            index: offset + index,
        });
    }
    // gripper stays absolute in both modes
    Ok(ArmCommand::new(joint, action[side.gripper_index()]))
}
