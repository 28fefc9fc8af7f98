use std::path::PathBuf;
use thiserror::Error;

/// Malformed or missing observation fields.
///
/// These never stop the loop, the normalizer substitutes a default and the
/// driver logs the issue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("camera {camera} missing from observation")]
    MissingCamera { camera: String },
    #[error("camera {camera} returned no image")]
    NoImage { camera: String },
    #[error("camera {camera} image has a zero dimension (shape={shape:?})")]
    EmptyImage { camera: String, shape: Vec<usize> },
    #[error("camera {camera} image is not an HxWxC array (shape={shape:?}, pixels={pixels})")]
    UndecodableImage {
        camera: String,
        shape: Vec<usize>,
        pixels: usize,
    },
    #[error("{arm} missing from observation")]
    MissingArm { arm: String },
    #[error("{arm} has no {field} reading")]
    MissingField { arm: String, field: &'static str },
    #[error("{arm} {field} has wrong size (expected {expected}, got {actual})")]
    WrongLength {
        arm: String,
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{arm} {field} contains a non finite value")]
    NonFinite { arm: String, field: &'static str },
}

/// Policy output that can't be turned into a move command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedActionError {
    #[error("action chunk has no frames")]
    EmptyChunk,
    #[error("action vector too short (expected at least {required}, got {len})")]
    TooShort { len: usize, required: usize },
    #[error("action element {index} is not finite")]
    NonFinite { index: usize },
}

/// Sensor, actuator or bus failure.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to connect to {device}: {message}")]
    Connection { device: String, message: String },
    #[error("failed to read sensor {sensor}: {message}")]
    Sensor { sensor: String, message: String },
    #[error("failed to command {arm}: {message}")]
    Actuator { arm: String, message: String },
    #[error("bus command {command} failed: {message}")]
    Bus {
        command: &'static str,
        message: String,
    },
    #[error("device error {0:?}")]
    Other(#[from] anyhow::Error),
}

/// Failure while loading or calling the policy.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("unknown policy configuration {0}")]
    UnknownConfig(String),
    #[error("failed to read checkpoint file {path:?}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse checkpoint file")]
    Parse(#[from] serde_json::Error),
    #[error("policy returned no actions")]
    NoActions,
    #[error("replay exhausted after {0} frames")]
    Exhausted(usize),
    #[error("inference error {0:?}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error while accessing configuration")]
    IoError(#[from] std::io::Error),
    #[error("error while parsing json")]
    JsonError(#[from] serde_json::Error),
    #[error("error while parsing yaml")]
    YamlError(#[from] serde_yaml::Error),
    #[error("expected {expected} joint limits, got {actual}")]
    JointLimitCount { expected: usize, actual: usize },
    #[error("joint limit {index} is inverted ({min} > {max})")]
    InvertedLimit { index: usize, min: f32, max: f32 },
    #[error("joint limit {index} is not finite ({min}, {max})")]
    NonFiniteLimit { index: usize, min: f32, max: f32 },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to create {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path:?}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Anything that ends a step or a run early.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    MalformedAction(#[from] MalformedActionError),
}
