use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::annotate::draw_detections;
use super::audit::{AuditLog, AuditRow};
use super::{free_sample_name, ArtifactKey, EvidenceStore};
use crate::frame::{DetectionBox, Frame};

const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Writes annotated JPEG artifacts under `flagged_dir` and owns the audit log.
pub struct FilesystemEvidenceWriter {
    flagged_dir: PathBuf,
    audit: AuditLog,
    jpeg_quality: u8,
}

impl FilesystemEvidenceWriter {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(flagged_dir: P, audit_path: Q) -> Result<Self> {
        let flagged_dir = flagged_dir.as_ref().to_path_buf();
        fs::create_dir_all(&flagged_dir)
            .with_context(|| format!("failed to create {}", flagged_dir.display()))?;
        let audit = AuditLog::open(audit_path)?;
        Ok(Self {
            flagged_dir,
            audit,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        })
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn flagged_dir(&self) -> &Path {
        &self.flagged_dir
    }

    pub fn audit_path(&self) -> &Path {
        self.audit.path()
    }

    fn write_annotated(&self, path: &Path, frame: &Frame, boxes: &[DetectionBox]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut image = frame.to_rgb_image()?;
        draw_detections(&mut image, boxes);
        write_jpeg(path, &image, self.jpeg_quality)
    }
}

fn write_jpeg(path: &Path, image: &RgbImage, quality: u8) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(image)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    Ok(())
}

impl EvidenceStore for FilesystemEvidenceWriter {
    fn save(
        &mut self,
        key: &ArtifactKey<'_>,
        frame: &Frame,
        bbox: &DetectionBox,
    ) -> Result<PathBuf> {
        let path = self.flagged_dir.join(key.relative_path()?);
        self.write_annotated(&path, frame, std::slice::from_ref(bbox))?;
        Ok(path)
    }

    fn delete(&mut self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("deleted evicted artifact {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("evicted artifact {} already gone", path.display())
            }
            Err(e) => log::debug!("ignoring delete failure for {}: {}", path.display(), e),
        }
    }

    fn append_log(&mut self, row: &AuditRow) -> Result<()> {
        self.audit.append(row)
    }

    fn flush(&mut self) -> Result<()> {
        self.audit.flush()
    }

    fn save_sample(
        &mut self,
        frame: &Frame,
        boxes: &[DetectionBox],
        at: SystemTime,
    ) -> Result<PathBuf> {
        let name = free_sample_name(at, |name| self.flagged_dir.join(name).exists())?;
        let path = self.flagged_dir.join(name);
        self.write_annotated(&path, frame, boxes)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn save_creates_entity_directory_and_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer =
            FilesystemEvidenceWriter::new(dir.path().join("flagged"), dir.path().join("log.csv"))?;
        let frame = Frame::synthetic(32, 24, 3)?;
        let key = ArtifactKey {
            entity_id: "7",
            display_name: "Grace Hopper",
            uid: 3,
            at: UNIX_EPOCH + Duration::from_secs(1_000),
        };
        let path = writer.save(&key, &frame, &DetectionBox::new(2.0, 2.0, 60.0, 60.0, 0.8))?;
        assert_eq!(
            path,
            dir.path()
                .join("flagged")
                .join("Grace_Hopper_7")
                .join("top_3_Grace_Hopper_1000.jpg")
        );
        let decoded = image::open(&path)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 24));

        writer.delete(&path);
        assert!(!path.exists());
        writer.delete(&path);
        Ok(())
    }

    #[test]
    fn sample_artifact_lands_in_flagged_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = FilesystemEvidenceWriter::new(dir.path(), dir.path().join("log.csv"))?;
        let frame = Frame::synthetic(16, 16, 0)?;
        let path = writer.save_sample(
            &frame,
            &[DetectionBox::new(1.0, 1.0, 5.0, 5.0, 0.4)],
            UNIX_EPOCH + Duration::from_secs(42),
        )?;
        assert_eq!(path, dir.path().join("flagged_sample_42.jpg"));
        assert!(path.exists());

        let again = writer.save_sample(&frame, &[], UNIX_EPOCH + Duration::from_secs(42))?;
        assert_eq!(again, dir.path().join("flagged_sample_42_2.jpg"));
        assert!(path.exists() && again.exists());
        Ok(())
    }
}
