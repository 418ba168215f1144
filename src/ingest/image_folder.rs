use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::display_name;
use crate::frame::Frame;

/// A single still image exposed as a one-frame source.
///
/// The file is decoded at open time so unreadable images are rejected before
/// the pipeline commits to them.
pub struct ImageSource {
    path: PathBuf,
    name: String,
    frame: Option<Frame>,
    frames_read: u64,
}

impl ImageSource {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("image {} does not exist", path.display()));
        }
        let image = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?
            .to_rgb8();
        Ok(Self {
            path: path.to_path_buf(),
            name: display_name(path),
            frame: Some(Frame::from_image(image)?),
            frames_read: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.frame.take();
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}
