use crate::error::SinkError;
use image::{ImageFormat, RgbImage};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Somewhere to put normalized frames for offline inspection
pub trait FrameSink: Send {
    fn save(&mut self, step: usize, camera: &str, image: &RgbImage) -> Result<PathBuf, SinkError>;
}

/// Writes `step_0000_<camera>.png` files into one directory
#[derive(Debug, Clone)]
pub struct PngFrameSink {
    dir: PathBuf,
}

impl PngFrameSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        PngFrameSink { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(step: usize, camera: &str) -> String {
        format!("step_{:04}_{}.png", step, camera)
    }
}

impl FrameSink for PngFrameSink {
    fn save(&mut self, step: usize, camera: &str, image: &RgbImage) -> Result<PathBuf, SinkError> {
        fs::create_dir_all(&self.dir).map_err(|source| SinkError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(PngFrameSink::file_name(step, camera));
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|source| SinkError::Encode {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}
