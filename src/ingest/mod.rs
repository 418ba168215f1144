//! Frame ingestion sources.
//!
//! A `SourceDescriptor` names what to read; a `SourceCursor` expands it into
//! concrete sources (one image, one video file, one camera) that are read
//! strictly one after another:
//! - Image folders: `.jpg .jpeg .png .bmp`, decoded with `image`, sorted by name
//! - Video folders: `.mp4 .avi .mov .mkv`, sorted by name
//! - Video files: FFmpeg (feature: ingest-file-ffmpeg) or `stub://` synthetic clips
//! - Cameras: V4L2 `/dev/video<index>` (feature: ingest-v4l2)
//!
//! Opening the first concrete source eagerly is how `SourceUnavailable`
//! surfaces at start time. Later sources that fail to open are logged and
//! skipped.

mod camera;
mod image_folder;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod video;
#[cfg(feature = "ingest-file-ffmpeg")]
mod video_ffmpeg;

pub use camera::CameraSource;
pub use image_folder::ImageSource;
pub use video::VideoSource;

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::frame::Frame;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv"];

/// Pacing rate assumed when a source does not report one.
pub const DEFAULT_FPS: f64 = 25.0;

// ----------------------------------------------------------------------------
// Descriptor
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    ImageFolder(PathBuf),
    VideoFolder(PathBuf),
    VideoFile(PathBuf),
    Camera(u32),
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageFolder(p) => write!(f, "images:{}", p.display()),
            Self::VideoFolder(p) => write!(f, "videos:{}", p.display()),
            Self::VideoFile(p) => write!(f, "video:{}", p.display()),
            Self::Camera(i) => write!(f, "camera:{}", i),
        }
    }
}

/// `images:<dir>`, `videos:<dir>`, `video:<file>` or `camera:<index>`.
impl FromStr for SourceDescriptor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("source '{}' must look like <kind>:<value>", s))?;
        if value.trim().is_empty() {
            return Err(anyhow!("source '{}' has an empty value", s));
        }
        match kind {
            "images" => Ok(Self::ImageFolder(PathBuf::from(value))),
            "videos" => Ok(Self::VideoFolder(PathBuf::from(value))),
            "video" => Ok(Self::VideoFile(PathBuf::from(value))),
            "camera" => Ok(Self::Camera(
                value
                    .parse()
                    .with_context(|| format!("invalid camera index '{}'", value))?,
            )),
            other => Err(anyhow!(
                "unknown source kind '{}' (expected images, videos, video or camera)",
                other
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// A source that cannot be opened. Fatal to `StreamPipeline::start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUnavailable {
    pub descriptor: SourceDescriptor,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(descriptor: &SourceDescriptor, reason: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SourceUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source {} unavailable: {}", self.descriptor, self.reason)
    }
}

impl std::error::Error for SourceUnavailable {}

fn unavailable(descriptor: &SourceDescriptor, reason: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(SourceUnavailable::new(descriptor, reason))
}

// ----------------------------------------------------------------------------
// Concrete sources
// ----------------------------------------------------------------------------

/// One concrete source, read frame by frame.
pub enum FrameSource {
    Image(ImageSource),
    Video(VideoSource),
    Camera(CameraSource),
}

impl FrameSource {
    /// Name used as the audit `sourceInfo` prefix and in frame events.
    pub fn name(&self) -> &str {
        match self {
            Self::Image(source) => source.name(),
            Self::Video(source) => source.name(),
            Self::Camera(source) => source.name(),
        }
    }

    /// Next decoded frame, or `None` once the source is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self {
            Self::Image(source) => source.next_frame(),
            Self::Video(source) => source.next_frame(),
            Self::Camera(source) => source.next_frame(),
        }
    }

    pub fn fps(&self) -> Option<f64> {
        match self {
            Self::Image(_) => None,
            Self::Video(source) => source.fps(),
            Self::Camera(source) => source.fps(),
        }
    }

    /// Total frames when the container reports it.
    pub fn frame_count(&self) -> Option<u64> {
        match self {
            Self::Image(_) => Some(1),
            Self::Video(source) => source.frame_count(),
            Self::Camera(_) => None,
        }
    }

    /// Position the read cursor so the next frame returned is `index` (0-based).
    pub fn seek(&mut self, index: u64) -> Result<()> {
        match self {
            Self::Video(source) => source.seek(index),
            Self::Image(_) | Self::Camera(_) if index == 0 => Ok(()),
            _ => Err(anyhow!("source {} does not support seeking", self.name())),
        }
    }

    pub fn frames_read(&self) -> u64 {
        match self {
            Self::Image(source) => source.frames_read(),
            Self::Video(source) => source.frames_read(),
            Self::Camera(source) => source.frames_read(),
        }
    }
}

#[derive(Clone, Debug)]
enum PendingSource {
    Image(PathBuf),
    Video(PathBuf),
    Camera(u32),
}

impl PendingSource {
    fn open(&self) -> Result<FrameSource> {
        match self {
            Self::Image(path) => Ok(FrameSource::Image(ImageSource::open(path)?)),
            Self::Video(path) => Ok(FrameSource::Video(VideoSource::open(path)?)),
            Self::Camera(index) => Ok(FrameSource::Camera(CameraSource::open(*index)?)),
        }
    }
}

/// Sequential walk over the concrete sources behind one descriptor.
pub struct SourceCursor {
    descriptor: SourceDescriptor,
    first: Option<FrameSource>,
    pending: VecDeque<PendingSource>,
}

impl SourceCursor {
    /// Expand the descriptor and open its first concrete source.
    ///
    /// Errors are `SourceUnavailable`.
    pub fn open(descriptor: &SourceDescriptor) -> Result<Self> {
        let mut pending = expand(descriptor)?;
        let mut first = None;
        let mut last_error = None;
        while let Some(next) = pending.pop_front() {
            match next.open() {
                Ok(source) => {
                    first = Some(source);
                    break;
                }
                Err(e) => {
                    log::warn!("skipping {:?}: {:#}", next, e);
                    last_error = Some(e);
                }
            }
        }
        let Some(first) = first else {
            let reason = last_error
                .map(|e| format!("{:#}", e))
                .unwrap_or_else(|| "no readable sources".to_string());
            return Err(unavailable(descriptor, reason));
        };
        Ok(Self {
            descriptor: descriptor.clone(),
            first: Some(first),
            pending,
        })
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Concrete sources not yet handed out (excluding an unopened-but-failed one).
    pub fn remaining(&self) -> usize {
        self.pending.len() + usize::from(self.first.is_some())
    }

    /// Next openable concrete source, or `None` when all are consumed.
    pub fn next_source(&mut self) -> Option<FrameSource> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        while let Some(next) = self.pending.pop_front() {
            match next.open() {
                Ok(source) => return Some(source),
                Err(e) => log::warn!("skipping {:?}: {:#}", next, e),
            }
        }
        None
    }
}

fn expand(descriptor: &SourceDescriptor) -> Result<VecDeque<PendingSource>> {
    match descriptor {
        SourceDescriptor::ImageFolder(dir) => {
            let files = list_files(dir, IMAGE_EXTENSIONS)
                .map_err(|e| unavailable(descriptor, format!("{:#}", e)))?;
            if files.is_empty() {
                return Err(unavailable(descriptor, "folder contains no images"));
            }
            Ok(files.into_iter().map(PendingSource::Image).collect())
        }
        SourceDescriptor::VideoFolder(dir) => {
            let files = list_files(dir, VIDEO_EXTENSIONS)
                .map_err(|e| unavailable(descriptor, format!("{:#}", e)))?;
            if files.is_empty() {
                return Err(unavailable(descriptor, "folder contains no videos"));
            }
            Ok(files.into_iter().map(PendingSource::Video).collect())
        }
        SourceDescriptor::VideoFile(path) => Ok(VecDeque::from([PendingSource::Video(
            path.clone(),
        )])),
        SourceDescriptor::Camera(index) => Ok(VecDeque::from([PendingSource::Camera(*index)])),
    }
}

/// Files directly inside `dir` whose extension (case-insensitive) is in `extensions`,
/// sorted by path.
pub fn list_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read folder {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Human-readable label for one concrete file.
pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parses_cli_form() -> Result<()> {
        assert_eq!(
            "images:/data/exam".parse::<SourceDescriptor>()?,
            SourceDescriptor::ImageFolder(PathBuf::from("/data/exam"))
        );
        assert_eq!(
            "camera:2".parse::<SourceDescriptor>()?,
            SourceDescriptor::Camera(2)
        );
        assert_eq!(
            "video:stub://clip?frames=3".parse::<SourceDescriptor>()?,
            SourceDescriptor::VideoFile(PathBuf::from("stub://clip?frames=3"))
        );
        assert!("camera:left".parse::<SourceDescriptor>().is_err());
        assert!("tape:/x".parse::<SourceDescriptor>().is_err());
        assert!("video:".parse::<SourceDescriptor>().is_err());
        Ok(())
    }

    #[test]
    fn list_files_filters_and_sorts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.mp4"] {
            fs::write(dir.path().join(name), b"x")?;
        }
        let files = list_files(dir.path(), IMAGE_EXTENSIONS)?;
        let names: Vec<String> = files.iter().map(|p| display_name(p)).collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG"]);
        Ok(())
    }

    #[test]
    fn empty_folder_is_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let descriptor = SourceDescriptor::ImageFolder(dir.path().to_path_buf());
        let err = SourceCursor::open(&descriptor).err().ok_or_else(|| anyhow!("opened"))?;
        let unavailable = err
            .downcast_ref::<SourceUnavailable>()
            .ok_or_else(|| anyhow!("wrong error type: {}", err))?;
        assert_eq!(unavailable.descriptor, descriptor);
        Ok(())
    }

    #[test]
    fn cursor_walks_synthetic_video() -> Result<()> {
        let descriptor = SourceDescriptor::VideoFile(PathBuf::from("stub://clip?frames=2"));
        let mut cursor = SourceCursor::open(&descriptor)?;
        let mut source = cursor.next_source().ok_or_else(|| anyhow!("no source"))?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert!(cursor.next_source().is_none());
        Ok(())
    }
}
