//! One-shot frame acquisition for "sample and detect".
//!
//! Synchronous and ledger-free: the caller decides whether to run detection
//! and feed the result through `DetectionProcessor`.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;

use crate::frame::Frame;
use crate::ingest::{
    list_files, CameraSource, ImageSource, SourceDescriptor, SourceUnavailable, VideoSource,
    IMAGE_EXTENSIONS, VIDEO_EXTENSIONS,
};

/// Frames read and discarded from a camera so auto-exposure can settle.
pub const CAMERA_WARMUP_FRAMES: usize = 10;

#[derive(Clone, Debug)]
pub struct SampledFrame {
    pub frame: Frame,
    /// Where the frame came from, e.g. `clip.mp4 @frame 12`.
    pub description: String,
}

pub struct FrameSampler {
    rng: StdRng,
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSampler {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sampler for tests and reproducible runs.
    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn sample(&mut self, descriptor: &SourceDescriptor) -> Result<SampledFrame> {
        match descriptor {
            SourceDescriptor::ImageFolder(dir) => {
                let images = list_or_unavailable(descriptor, dir, IMAGE_EXTENSIONS)?;
                let chosen = images
                    .choose(&mut self.rng)
                    .ok_or_else(|| unavailable(descriptor, "folder contains no images"))?;
                let mut source =
                    ImageSource::open(chosen).map_err(|e| unavailable(descriptor, format!("{:#}", e)))?;
                let frame = source
                    .next_frame()?
                    .ok_or_else(|| anyhow!("image {} produced no frame", chosen.display()))?;
                Ok(SampledFrame {
                    frame,
                    description: chosen.display().to_string(),
                })
            }
            SourceDescriptor::VideoFolder(dir) => {
                let videos = list_or_unavailable(descriptor, dir, VIDEO_EXTENSIONS)?;
                let chosen = videos
                    .choose(&mut self.rng)
                    .ok_or_else(|| unavailable(descriptor, "folder contains no videos"))?
                    .clone();
                self.sample_video(descriptor, &chosen)
            }
            SourceDescriptor::VideoFile(path) => self.sample_video(descriptor, path),
            SourceDescriptor::Camera(index) => sample_camera(descriptor, *index),
        }
    }

    /// Seek to a random frame; without a known frame count, take the first.
    fn sample_video(&mut self, descriptor: &SourceDescriptor, path: &Path) -> Result<SampledFrame> {
        let mut source =
            VideoSource::open(path).map_err(|e| unavailable(descriptor, format!("{:#}", e)))?;
        let total = source.frame_count().filter(|n| *n > 0);
        let Some(total) = total else {
            let frame = source
                .next_frame()?
                .ok_or_else(|| anyhow!("video {} produced no frames", path.display()))?;
            return Ok(SampledFrame {
                frame,
                description: path.display().to_string(),
            });
        };

        let index = self.rng.gen_range(0..total);
        source.seek(index)?;
        let frame = source
            .next_frame()?
            .ok_or_else(|| anyhow!("video {} ended before frame {}", path.display(), index))?;
        Ok(SampledFrame {
            frame,
            description: format!("{} @frame {}", path.display(), index),
        })
    }
}

fn sample_camera(descriptor: &SourceDescriptor, index: u32) -> Result<SampledFrame> {
    let mut camera =
        CameraSource::open(index).map_err(|e| unavailable(descriptor, format!("{:#}", e)))?;
    let mut last = None;
    for _ in 0..CAMERA_WARMUP_FRAMES {
        match camera.next_frame() {
            Ok(Some(frame)) => last = Some(frame),
            Ok(None) => break,
            Err(e) => {
                log::warn!("camera {} read failed during warm-up: {:#}", index, e);
                break;
            }
        }
    }
    let frame = last.ok_or_else(|| anyhow!("camera {} returned no frames", index))?;
    Ok(SampledFrame {
        frame,
        description: format!("camera_{}_frame{}", index, camera.frames_read()),
    })
}

fn list_or_unavailable(
    descriptor: &SourceDescriptor,
    dir: &Path,
    extensions: &[&str],
) -> Result<Vec<std::path::PathBuf>> {
    list_files(dir, extensions).map_err(|e| unavailable(descriptor, format!("{:#}", e)))
}

fn unavailable(descriptor: &SourceDescriptor, reason: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(SourceUnavailable::new(descriptor, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::path::PathBuf;

    #[test]
    fn samples_a_random_image_from_folder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for (i, name) in ["a.png", "b.png", "c.bmp"].iter().enumerate() {
            RgbImage::from_pixel(4, 4, image::Rgb([i as u8, 0, 0])).save(dir.path().join(name))?;
        }
        let descriptor = SourceDescriptor::ImageFolder(dir.path().to_path_buf());
        let mut sampler = FrameSampler::with_seed(7);
        let sampled = sampler.sample(&descriptor)?;
        assert_eq!((sampled.frame.width, sampled.frame.height), (4, 4));
        assert!(sampled.description.starts_with(&dir.path().display().to_string()));

        let mut again = FrameSampler::with_seed(7);
        assert_eq!(again.sample(&descriptor)?.description, sampled.description);
        Ok(())
    }

    #[test]
    fn seeks_into_synthetic_video() -> Result<()> {
        let descriptor =
            SourceDescriptor::VideoFile(PathBuf::from("stub://exam?frames=50&width=8&height=8"));
        let mut sampler = FrameSampler::with_seed(1);
        let sampled = sampler.sample(&descriptor)?;
        let index: u64 = sampled
            .description
            .rsplit(' ')
            .next()
            .ok_or_else(|| anyhow!("no index"))?
            .parse()?;
        assert!(index < 50);
        assert_eq!(sampled.frame.pixels(), Frame::synthetic(8, 8, index)?.pixels());
        Ok(())
    }

    #[test]
    fn empty_folders_are_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sampler = FrameSampler::with_seed(0);
        for descriptor in [
            SourceDescriptor::ImageFolder(dir.path().to_path_buf()),
            SourceDescriptor::VideoFolder(dir.path().to_path_buf()),
            SourceDescriptor::ImageFolder(dir.path().join("missing")),
        ] {
            let err = sampler.sample(&descriptor).err().ok_or_else(|| anyhow!("sampled"))?;
            assert!(err.downcast_ref::<SourceUnavailable>().is_some());
        }
        Ok(())
    }

    #[test]
    fn missing_camera_is_unavailable() {
        let mut sampler = FrameSampler::with_seed(0);
        let err = sampler.sample(&SourceDescriptor::Camera(999)).err();
        assert!(err
            .as_ref()
            .and_then(|e| e.downcast_ref::<SourceUnavailable>())
            .is_some());
    }
}
