use crate::action_mapper::{ArmSide, JointVector, ACTION_DIM, JOINT_COUNT};
use crate::error::ValidationError;
use image::{imageops, imageops::FilterType, RgbImage};
use nalgebra as na;
use std::collections::BTreeMap;

pub const STATE_DIM: usize = ACTION_DIM;
/// Side length of every image handed to the policy
pub const IMAGE_SIZE: u32 = 224;

/// `[left_joint(6), left_gripper, right_joint(6), right_gripper]`
pub type StateVector = na::SVector<f32, STATE_DIM>;

#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    U8(Vec<u8>),
    /// Expected to be in 0.0..=1.0
    F32(Vec<f32>),
}

impl Pixels {
    pub fn len(&self) -> usize {
        match self {
            Pixels::U8(data) => data.len(),
            Pixels::F32(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Pixels::U8(_) => "u8",
            Pixels::F32(_) => "f32",
        }
    }

    /// Smallest and largest pixel value
    pub fn range(&self) -> Option<(f32, f32)> {
        let fold = |range: Option<(f32, f32)>, value: f32| match range {
            None => Some((value, value)),
            Some((min, max)) => Some((min.min(value), max.max(value))),
        };
        match self {
            Pixels::U8(data) => data.iter().map(|&v| v as f32).fold(None, fold),
            Pixels::F32(data) => data.iter().copied().fold(None, fold),
        }
    }

    fn to_u8(&self) -> Vec<u8> {
        match self {
            Pixels::U8(data) => data.clone(),
            // NaN saturates to 0
            Pixels::F32(data) => data
                .iter()
                .map(|value| (value.clamp(0.0, 1.0) * 255.0) as u8)
                .collect(),
        }
    }
}

/// One color frame as the camera SDK hands it over, row major
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub shape: Vec<usize>,
    pub pixels: Pixels,
}

impl CameraFrame {
    pub fn new(shape: Vec<usize>, pixels: Pixels) -> CameraFrame {
        CameraFrame { shape, pixels }
    }

    pub fn from_rgb(image: &RgbImage) -> CameraFrame {
        let (width, height) = image.dimensions();
        CameraFrame::new(
            vec![height as usize, width as usize, 3],
            Pixels::U8(image.as_raw().clone()),
        )
    }

    pub fn solid(height: usize, width: usize, color: [u8; 3]) -> CameraFrame {
        let data = std::iter::repeat(color)
            .take(height * width)
            .flatten()
            .collect();
        CameraFrame::new(vec![height, width, 3], Pixels::U8(data))
    }

    pub fn has_zero_dimension(&self) -> bool {
        self.shape.is_empty() || self.shape.contains(&0)
    }

    /// Declared shape matches the pixel count
    pub fn is_decodable(&self) -> bool {
        !self.shape.is_empty() && self.shape.iter().product::<usize>() == self.pixels.len()
    }

    fn to_rgb(&self) -> Option<RgbImage> {
        if self.has_zero_dimension() || !self.is_decodable() {
            return None;
        }
        let bytes = self.pixels.to_u8();
        match *self.shape.as_slice() {
            [height, width] => {
                let rgb = bytes.iter().flat_map(|&value| [value; 3]).collect();
                RgbImage::from_raw(u32::try_from(width).ok()?, u32::try_from(height).ok()?, rgb)
            }
            [height, width, 3] => {
                RgbImage::from_raw(u32::try_from(width).ok()?, u32::try_from(height).ok()?, bytes)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArmReading {
    /// Joint angles in radians
    pub joint: Option<Vec<f32>>,
    pub gripper: Option<Vec<f32>>,
}

impl ArmReading {
    pub fn new(joint: Vec<f32>, gripper: f32) -> ArmReading {
        ArmReading {
            joint: Some(joint),
            gripper: Some(vec![gripper]),
        }
    }
}

/// Everything captured from the robot in one step
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawObservation {
    pub arms: BTreeMap<String, ArmReading>,
    pub cameras: BTreeMap<String, Option<CameraFrame>>,
}

impl RawObservation {
    pub fn new() -> RawObservation {
        RawObservation::default()
    }

    pub fn with_arm(mut self, name: &str, reading: ArmReading) -> Self {
        self.arms.insert(name.to_owned(), reading);
        self
    }

    pub fn with_camera(mut self, name: &str, frame: Option<CameraFrame>) -> Self {
        self.cameras.insert(name.to_owned(), frame);
        self
    }

    pub fn camera_shapes(&self) -> BTreeMap<String, Option<Vec<usize>>> {
        self.cameras
            .iter()
            .map(|(name, frame)| (name.clone(), frame.as_ref().map(|f| f.shape.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSlot {
    pub source: String,
    pub policy_key: String,
}

impl CameraSlot {
    pub fn new(source: &str, policy_key: &str) -> CameraSlot {
        CameraSlot {
            source: source.to_owned(),
            policy_key: policy_key.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerConfig {
    pub cameras: Vec<CameraSlot>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        NormalizerConfig {
            cameras: vec![
                CameraSlot::new("cam_head", "cam_high"),
                CameraSlot::new("cam_left_wrist", "cam_left_wrist"),
                CameraSlot::new("cam_right_wrist", "cam_right_wrist"),
            ],
        }
    }
}

/// Fixed shape input for the policy
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedObservation {
    pub images: BTreeMap<String, RgbImage>,
    pub state: StateVector,
}

impl NormalizedObservation {
    pub fn joints(&self, side: ArmSide) -> JointVector {
        self.state.fixed_rows::<JOINT_COUNT>(side.offset()).into_owned()
    }

    pub fn gripper(&self, side: ArmSide) -> f32 {
        self.state[side.gripper_index()]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub observation: NormalizedObservation,
    /// Problems that were papered over with defaults
    pub issues: Vec<ValidationError>,
}

#[derive(Debug, Clone, Default)]
pub struct ObservationNormalizer {
    config: NormalizerConfig,
}

impl ObservationNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        ObservationNormalizer { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn validate(&self, raw: &RawObservation) -> Vec<ValidationError> {
        let mut issues = Vec::new();
        for slot in &self.config.cameras {
            let camera = slot.source.clone();
            match raw.cameras.get(&slot.source) {
                None => issues.push(ValidationError::MissingCamera { camera }),
                Some(None) => issues.push(ValidationError::NoImage { camera }),
                Some(Some(frame)) if frame.has_zero_dimension() => {
                    issues.push(ValidationError::EmptyImage {
                        camera,
                        shape: frame.shape.clone(),
                    })
                }
                Some(Some(frame)) if !frame.is_decodable() => {
                    issues.push(ValidationError::UndecodableImage {
                        camera,
                        shape: frame.shape.clone(),
                        pixels: frame.pixels.len(),
                    })
                }
                Some(Some(_)) => {}
            }
        }
        for side in ArmSide::BOTH {
            let arm = side.name().to_owned();
            match raw.arms.get(side.name()) {
                None => issues.push(ValidationError::MissingArm { arm }),
                Some(reading) => {
                    check_field(&arm, "joint", &reading.joint, JOINT_COUNT, &mut issues);
                    check_field(&arm, "gripper", &reading.gripper, 1, &mut issues);
                }
            }
        }
        issues
    }

    /// Best effort conversion, never fails
    ///
    /// Missing images become black frames and the state vector is padded or
    /// truncated. Everything that had to be substituted is listed in `issues`.
    pub fn normalize(&self, raw: &RawObservation) -> Normalized {
        let images = self
            .config
            .cameras
            .iter()
            .map(|slot| {
                let frame = raw.cameras.get(&slot.source).and_then(Option::as_ref);
                (slot.policy_key.clone(), letterbox(frame))
            })
            .collect();
        Normalized {
            observation: NormalizedObservation {
                images,
                state: assemble_state(&raw.arms),
            },
            issues: self.validate(raw),
        }
    }
}

fn check_field(
    arm: &str,
    field: &'static str,
    values: &Option<Vec<f32>>,
    expected: usize,
    issues: &mut Vec<ValidationError>,
) {
    let arm = arm.to_owned();
    match values {
        None => issues.push(ValidationError::MissingField { arm, field }),
        Some(values) if values.len() != expected => issues.push(ValidationError::WrongLength {
            arm,
            field,
            expected,
            actual: values.len(),
        }),
        Some(values) if values.iter().any(|value| !value.is_finite()) => {
            issues.push(ValidationError::NonFinite { arm, field })
        }
        Some(_) => {}
    }
}

/// Concatenate both arms and force the result to `STATE_DIM` values
pub fn assemble_state(arms: &BTreeMap<String, ArmReading>) -> StateVector {
    let mut values = Vec::with_capacity(STATE_DIM);
    for side in ArmSide::BOTH {
        if let Some(reading) = arms.get(side.name()) {
            values.extend(reading.joint.iter().flatten());
            values.extend(reading.gripper.iter().flatten());
        }
    }
    values.resize(STATE_DIM, 0.0);
    StateVector::from_column_slice(&values)
}

/// Aspect preserving resize onto a black `IMAGE_SIZE` x `IMAGE_SIZE` canvas
///
/// Frames that can't be read as grayscale or RGB come back all black.
pub fn letterbox(frame: Option<&CameraFrame>) -> RgbImage {
    let size = IMAGE_SIZE;
    let mut canvas = RgbImage::new(size, size);
    let Some(rgb) = frame.and_then(CameraFrame::to_rgb) else {
        return canvas;
    };
    let (width, height) = rgb.dimensions();
    let scale = f64::min(size as f64 / width as f64, size as f64 / height as f64);
    let scaled = |dimension: u32| ((dimension as f64 * scale).round() as u32).clamp(1, size);
    let (new_width, new_height) = (scaled(width), scaled(height));
    let resized = imageops::resize(&rgb, new_width, new_height, FilterType::Triangle);
    let x = (size - new_width) / 2;
    let y = (size - new_height) / 2;
    imageops::replace(&mut canvas, &resized, x as i64, y as i64);
    canvas
}
