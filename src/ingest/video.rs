//! Video file source.
//!
//! `stub://<name>?frames=N&width=W&height=H&fps=F` paths produce synthetic
//! clips (no decoding, deterministic pixels). Anything else is decoded with
//! FFmpeg when the `ingest-file-ffmpeg` feature is enabled.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::video_ffmpeg::FfmpegVideoSource;
use crate::frame::Frame;

pub struct VideoSource {
    backend: VideoBackend,
}

enum VideoBackend {
    Synthetic(SyntheticVideoSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegVideoSource),
}

impl VideoSource {
    pub fn open(path: &Path) -> Result<Self> {
        let raw = path.to_string_lossy();
        if let Some(spec) = raw.strip_prefix("stub://") {
            return Ok(Self {
                backend: VideoBackend::Synthetic(SyntheticVideoSource::parse(spec)?),
            });
        }
        if raw.contains("://") {
            return Err(anyhow!(
                "video ingestion only supports local paths (no URL schemes)"
            ));
        }
        if !path.is_file() {
            return Err(anyhow!("video {} does not exist", path.display()));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                backend: VideoBackend::Ffmpeg(FfmpegVideoSource::open(path)?),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "decoding {} requires the ingest-file-ffmpeg feature",
                path.display()
            ))
        }
    }

    pub fn name(&self) -> &str {
        match &self.backend {
            VideoBackend::Synthetic(source) => &source.name,
            #[cfg(feature = "ingest-file-ffmpeg")]
            VideoBackend::Ffmpeg(source) => source.name(),
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            VideoBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            VideoBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    pub fn fps(&self) -> Option<f64> {
        match &self.backend {
            VideoBackend::Synthetic(source) => Some(source.fps),
            #[cfg(feature = "ingest-file-ffmpeg")]
            VideoBackend::Ffmpeg(source) => source.fps(),
        }
    }

    pub fn frame_count(&self) -> Option<u64> {
        match &self.backend {
            VideoBackend::Synthetic(source) => Some(source.total),
            #[cfg(feature = "ingest-file-ffmpeg")]
            VideoBackend::Ffmpeg(source) => source.frame_count(),
        }
    }

    pub fn seek(&mut self, index: u64) -> Result<()> {
        match &mut self.backend {
            VideoBackend::Synthetic(source) => {
                source.position = index.min(source.total);
                Ok(())
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            VideoBackend::Ffmpeg(source) => source.seek(index),
        }
    }

    pub fn frames_read(&self) -> u64 {
        match &self.backend {
            VideoBackend::Synthetic(source) => source.frames_read,
            #[cfg(feature = "ingest-file-ffmpeg")]
            VideoBackend::Ffmpeg(source) => source.frames_read(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticVideoSource {
    name: String,
    total: u64,
    width: u32,
    height: u32,
    fps: f64,
    position: u64,
    frames_read: u64,
}

impl SyntheticVideoSource {
    fn parse(spec: &str) -> Result<Self> {
        let (name, query) = spec.split_once('?').unwrap_or((spec, ""));
        if name.is_empty() {
            return Err(anyhow!("stub video needs a name (stub://<name>)"));
        }
        let mut source = Self {
            name: name.to_string(),
            total: 30,
            width: 320,
            height: 240,
            fps: 25.0,
            position: 0,
            frames_read: 0,
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub parameter '{}' must be key=value", pair))?;
            let bad = || format!("invalid stub parameter {}={}", key, value);
            match key {
                "frames" => source.total = value.parse().with_context(bad)?,
                "width" => source.width = value.parse().with_context(bad)?,
                "height" => source.height = value.parse().with_context(bad)?,
                "fps" => source.fps = value.parse().with_context(bad)?,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if source.width == 0 || source.height == 0 {
            return Err(anyhow!("stub video dimensions must be non-zero"));
        }
        if !source.fps.is_finite() || source.fps <= 0.0 {
            return Err(anyhow!("stub video fps must be positive"));
        }
        log::info!(
            "VideoSource: opened {} (synthetic, {} frames)",
            source.name,
            source.total
        );
        Ok(source)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.position >= self.total {
            return Ok(None);
        }
        let frame = Frame::synthetic(self.width, self.height, self.position)?;
        self.position += 1;
        self.frames_read += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_clip_honours_parameters() -> Result<()> {
        let mut source = VideoSource::open(Path::new("stub://lab?frames=3&width=8&height=6"))?;
        assert_eq!(source.name(), "lab");
        assert_eq!(source.frame_count(), Some(3));
        let frame = source.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!((frame.width, frame.height), (8, 6));
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn synthetic_seek_moves_cursor() -> Result<()> {
        let mut source = VideoSource::open(Path::new("stub://lab?frames=5&width=4&height=4"))?;
        source.seek(4)?;
        let frame = source.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!(frame.pixels(), Frame::synthetic(4, 4, 4)?.pixels());
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn rejects_urls_and_missing_files() {
        assert!(VideoSource::open(Path::new("rtsp://camera/stream")).is_err());
        assert!(VideoSource::open(Path::new("/definitely/missing.mp4")).is_err());
        assert!(VideoSource::open(Path::new("stub://x?frames=abc")).is_err());
    }
}
