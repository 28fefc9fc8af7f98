use crate::error::InferenceError;
use crate::observation::{NormalizedObservation, StateVector};
use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Keys searched, in order, when the policy answers with a mapping
pub const ACTION_KEYS: [&str; 3] = ["actions", "action", "policy_action"];

/// Future actions predicted by one inference call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionChunk {
    frames: Vec<Vec<f32>>,
}

impl ActionChunk {
    /// A single action vector
    pub fn from_vector(action: Vec<f32>) -> ActionChunk {
        ActionChunk {
            frames: vec![action],
        }
    }

    pub fn from_frames(frames: Vec<Vec<f32>>) -> ActionChunk {
        ActionChunk { frames }
    }

    pub fn frames(&self) -> &[Vec<f32>] {
        &self.frames
    }

    pub fn first_frame(&self) -> Option<&[f32]> {
        self.frames.first().map(Vec::as_slice)
    }

    /// (frames, width of the first frame)
    pub fn shape(&self) -> (usize, usize) {
        (self.frames.len(), self.frames.first().map_or(0, Vec::len))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutput {
    Chunk(ActionChunk),
    Mapping(BTreeMap<String, Option<ActionChunk>>),
}

impl PolicyOutput {
    pub fn into_chunk(self) -> Option<ActionChunk> {
        match self {
            PolicyOutput::Chunk(chunk) => Some(chunk),
            PolicyOutput::Mapping(mut mapping) => ACTION_KEYS
                .iter()
                .find_map(|key| mapping.remove(*key).flatten()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyInput {
    pub images: BTreeMap<String, RgbImage>,
    pub state: StateVector,
    pub task: Option<String>,
}

impl PolicyInput {
    pub fn new(observation: NormalizedObservation, task: Option<String>) -> PolicyInput {
        PolicyInput {
            images: observation.images,
            state: observation.state,
            task,
        }
    }
}

#[async_trait]
pub trait Policy: Send {
    async fn infer(&mut self, input: &PolicyInput) -> Result<PolicyOutput, InferenceError>;
}

#[async_trait]
impl<T: Policy + ?Sized> Policy for Box<T> {
    async fn infer(&mut self, input: &PolicyInput) -> Result<PolicyOutput, InferenceError> {
        (**self).infer(input).await
    }
}

fn default_horizon() -> usize {
    1
}

/// Named policy configuration from the deploy config
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicySpec {
    /// Always predicts zeros, handy for checking the plumbing
    Zero {
        action_dim: usize,
        #[serde(default = "default_horizon")]
        horizon: usize,
    },
    /// Replays recorded frames, path is relative to the checkpoint directory
    Replay { file: PathBuf },
}

pub fn load_policy(
    spec: &PolicySpec,
    checkpoint: &Path,
) -> Result<Box<dyn Policy>, InferenceError> {
    match spec {
        PolicySpec::Zero {
            action_dim,
            horizon,
        } => Ok(Box::new(ZeroPolicy::new(*action_dim, *horizon))),
        PolicySpec::Replay { file } => {
            Ok(Box::new(ReplayPolicy::load(checkpoint.join(file))?))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZeroPolicy {
    action_dim: usize,
    horizon: usize,
}

impl ZeroPolicy {
    pub fn new(action_dim: usize, horizon: usize) -> Self {
        ZeroPolicy {
            action_dim,
            horizon,
        }
    }
}

#[async_trait]
impl Policy for ZeroPolicy {
    async fn infer(&mut self, _input: &PolicyInput) -> Result<PolicyOutput, InferenceError> {
        Ok(PolicyOutput::Chunk(ActionChunk::from_frames(vec![
            vec![0.0; self.action_dim];
            self.horizon
        ])))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayFile {
    Wrapped { actions: Vec<Vec<f32>> },
    Bare(Vec<Vec<f32>>),
}

/// Hands out one recorded frame per call
#[derive(Debug, Clone)]
pub struct ReplayPolicy {
    frames: Vec<Vec<f32>>,
    cursor: usize,
}

impl ReplayPolicy {
    pub fn new(frames: Vec<Vec<f32>>) -> Self {
        ReplayPolicy { frames, cursor: 0 }
    }

    pub fn parse_json(text: &str) -> Result<Self, InferenceError> {
        let frames = match serde_json::from_str(text)? {
            ReplayFile::Wrapped { actions } => actions,
            ReplayFile::Bare(frames) => frames,
        };
        Ok(ReplayPolicy::new(frames))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| InferenceError::Checkpoint {
            path: path.to_owned(),
            source,
        })?;
        ReplayPolicy::parse_json(&text)
    }

    pub fn remaining(&self) -> usize {
        self.frames.len() - self.cursor
    }
}

#[async_trait]
impl Policy for ReplayPolicy {
    async fn infer(&mut self, _input: &PolicyInput) -> Result<PolicyOutput, InferenceError> {
        let frame = self
            .frames
            .get(self.cursor)
            .cloned()
            .ok_or(InferenceError::Exhausted(self.frames.len()))?;
        self.cursor += 1;
        let mut mapping = BTreeMap::new();
        mapping.insert("actions".to_owned(), Some(ActionChunk::from_vector(frame)));
        Ok(PolicyOutput::Mapping(mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PolicyInput {
        PolicyInput {
            images: BTreeMap::new(),
            state: StateVector::zeros(),
            task: None,
        }
    }

    #[test]
    fn bare_chunk_is_used_directly() {
        let chunk = ActionChunk::from_vector(vec![1.0; 14]);
        assert_eq!(PolicyOutput::Chunk(chunk.clone()).into_chunk(), Some(chunk));
    }

    #[test]
    fn mapping_keys_are_searched_in_order() {
        let frame = |value| Some(ActionChunk::from_vector(vec![value]));
        let mut mapping = BTreeMap::new();
        mapping.insert("policy_action".to_owned(), frame(3.0));
        mapping.insert("action".to_owned(), frame(2.0));
        mapping.insert("actions".to_owned(), None);
        mapping.insert("other".to_owned(), frame(9.0));
        let chunk = PolicyOutput::Mapping(mapping).into_chunk().unwrap();
        assert_eq!(chunk.first_frame(), Some(&[2.0][..]));
    }

    #[test]
    fn mapping_without_actions_is_none() {
        let mut mapping = BTreeMap::new();
        mapping.insert("actions".to_owned(), None);
        mapping.insert("logits".to_owned(), Some(ActionChunk::default()));
        assert_eq!(PolicyOutput::Mapping(mapping).into_chunk(), None);
    }

    #[test]
    fn chunk_shape() {
        let chunk = ActionChunk::from_frames(vec![vec![0.0; 32]; 50]);
        assert_eq!(chunk.shape(), (50, 32));
        assert_eq!(ActionChunk::default().shape(), (0, 0));
        assert_eq!(ActionChunk::default().first_frame(), None);
    }

    #[tokio::test]
    async fn zero_policy_emits_zero_chunk() {
        let mut policy = ZeroPolicy::new(14, 4);
        let chunk = policy.infer(&input()).await.unwrap().into_chunk().unwrap();
        assert_eq!(chunk.shape(), (4, 14));
        assert!(chunk.frames().iter().flatten().all(|&value| value == 0.0));
    }

    #[tokio::test]
    async fn replay_policy_runs_out() {
        let mut policy = ReplayPolicy::parse_json("[[1.0, 2.0], [3.0, 4.0]]").unwrap();
        assert_eq!(policy.remaining(), 2);
        let first = policy.infer(&input()).await.unwrap().into_chunk().unwrap();
        assert_eq!(first.first_frame(), Some(&[1.0, 2.0][..]));
        let second = policy.infer(&input()).await.unwrap().into_chunk().unwrap();
        assert_eq!(second.first_frame(), Some(&[3.0, 4.0][..]));
        assert!(matches!(
            policy.infer(&input()).await,
            Err(InferenceError::Exhausted(2))
        ));
    }

    #[test]
    fn replay_file_may_be_wrapped() {
        let policy = ReplayPolicy::parse_json(r#"{"actions": [[0.5, 0.5, 0.5]]}"#).unwrap();
        assert_eq!(policy.remaining(), 1);
        assert!(matches!(
            ReplayPolicy::parse_json("{\"actions\": 3}"),
            Err(InferenceError::Parse(_))
        ));
    }

    #[test]
    fn load_policy_reads_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("actions.json"), "[[0.0, 1.0]]").unwrap();
        let spec = PolicySpec::Replay {
            file: PathBuf::from("actions.json"),
        };
        assert!(load_policy(&spec, dir.path()).is_ok());

        let missing = PolicySpec::Replay {
            file: PathBuf::from("missing.json"),
        };
        assert!(matches!(
            load_policy(&missing, dir.path()),
            Err(InferenceError::Checkpoint { .. })
        ));
    }

    #[test]
    fn policy_spec_parses_kind() {
        let spec: PolicySpec =
            serde_json::from_str(r#"{"kind": "zero", "action_dim": 14}"#).unwrap();
        assert_eq!(
            spec,
            PolicySpec::Zero {
                action_dim: 14,
                horizon: 1
            }
        );
    }
}
