use crate::action_mapper::{JointLimits, JOINT_COUNT};
use crate::error::{ConfigError, InferenceError};
use crate::observation::{CameraSlot, NormalizerConfig};
use crate::policy::PolicySpec;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf, time::Duration};

type Result<T> = std::result::Result<T, ConfigError>;

lazy_static! {
    static ref INCLUDED: DeployConfig = {
        let json = include_str!("../config/piper_dual.json");
        DeployConfig::parse_json(json).expect("included config is valid")
    };
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct JointLimitConfig {
    pub min_deg: f32,
    pub max_deg: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CameraConfig {
    /// Name the robot reports the frame under
    pub source: String,
    /// Name the policy expects the frame under
    pub policy_key: String,
    /// Depth camera serial number
    pub serial: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArmPortConfig {
    pub name: String,
    pub can_port: String,
    /// Pose the arm is sent to on reset
    pub start_position_deg: [f32; JOINT_COUNT],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub step_delay_ms: u64,
    pub debug_image_dir: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            step_delay_ms: 500,
            debug_image_dir: PathBuf::from("/tmp/robot_debug_images"),
        }
    }
}

impl DriverConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Hardware topology and pipeline settings for one robot installation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeployConfig {
    pub joint_limits: Vec<JointLimitConfig>,
    pub cameras: Vec<CameraConfig>,
    pub arms: Vec<ArmPortConfig>,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySpec>,
}

impl DeployConfig {
    /// The dual arm setup comes with an included config file.
    ///
    /// This file is packaged with the binary
    /// This method retrieves this included version
    pub fn included() -> DeployConfig {
        INCLUDED.clone()
    }

    pub fn joint_limits(&self) -> Result<JointLimits> {
        if self.joint_limits.len() != JOINT_COUNT {
            return Err(ConfigError::JointLimitCount {
                expected: JOINT_COUNT,
                actual: self.joint_limits.len(),
            });
        }
        let mut degrees = [(0.0, 0.0); JOINT_COUNT];
        for (index, limit) in self.joint_limits.iter().enumerate() {
            if !limit.min_deg.is_finite() || !limit.max_deg.is_finite() {
                return Err(ConfigError::NonFiniteLimit {
                    index,
                    min: limit.min_deg,
                    max: limit.max_deg,
                });
            }
            if limit.min_deg > limit.max_deg {
                return Err(ConfigError::InvertedLimit {
                    index,
                    min: limit.min_deg,
                    max: limit.max_deg,
                });
            }
            degrees[index] = (limit.min_deg, limit.max_deg);
        }
        Ok(JointLimits::from_degrees(degrees))
    }

    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            cameras: self
                .cameras
                .iter()
                .map(|camera| CameraSlot::new(&camera.source, &camera.policy_key))
                .collect(),
        }
    }

    pub fn arm(&self, name: &str) -> Option<&ArmPortConfig> {
        self.arms.iter().find(|arm| arm.name == name)
    }

    pub fn policy(&self, name: &str) -> std::result::Result<&PolicySpec, InferenceError> {
        self.policies
            .get(name)
            .ok_or_else(|| InferenceError::UnknownConfig(name.to_owned()))
    }

    pub fn parse_json(text: &str) -> Result<DeployConfig> {
        let config: DeployConfig = serde_json::from_str(text)?;
        Ok(config)
    }

    pub fn parse_yaml(text: &str) -> Result<DeployConfig> {
        let config: DeployConfig = serde_yaml::from_str(text)?;
        Ok(config)
    }

    pub fn serialize_to_json(&self) -> Result<String> {
        let json = serde_json::to_string_pretty(self)?;
        Ok(json)
    }

    pub fn serialize_to_yaml(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(yaml)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.serialize_to_json()?)?;
        Ok(())
    }

    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.serialize_to_yaml()?)?;
        Ok(())
    }

    /// Load from a json or yaml file, picked by extension
    pub fn load(path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => DeployConfig::parse_yaml(&text),
            _ => DeployConfig::parse_json(&text),
        }
    }
}
