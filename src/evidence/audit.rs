use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const AUDIT_HEADER: &str =
    "timestamp,artifactPath,sourceInfo,entityName,entityId,confidence,centerX,centerY";

/// One audit row per (event, entity) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditRow {
    pub timestamp: SystemTime,
    /// `None` when the artifact could not be written.
    pub artifact_path: Option<PathBuf>,
    pub source_info: String,
    pub entity_name: String,
    pub entity_id: String,
    pub confidence: f32,
    pub center_x: f32,
    pub center_y: f32,
}

impl AuditRow {
    pub fn to_csv_line(&self) -> String {
        let timestamp = DateTime::<Local>::from(self.timestamp)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let path = self
            .artifact_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        [
            csv_field(&timestamp),
            csv_field(&path),
            csv_field(&self.source_info),
            csv_field(&self.entity_name),
            csv_field(&self.entity_id),
            format!("{:.4}", self.confidence),
            format!("{:.1}", self.center_x),
            format!("{:.1}", self.center_y),
        ]
        .join(",")
    }
}

/// Quote a field when it contains a delimiter, a quote or a line break.
fn csv_field(value: &str) -> String {
    if value.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Append-only CSV audit log.
///
/// The header is written only when the file is new or empty, so reopening an
/// existing log continues it.
pub struct AuditLog {
    path: PathBuf,
    writer: BufWriter<File>,
    rows_written: u64,
}

impl AuditLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let needs_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        if needs_header {
            writeln!(writer, "{}", AUDIT_HEADER)?;
            writer.flush()?;
        }
        Ok(Self {
            path,
            writer,
            rows_written: 0,
        })
    }

    pub fn append(&mut self, row: &AuditRow) -> Result<()> {
        writeln!(self.writer, "{}", row.to_csv_line())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this handle.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("audit log {} not flushed on drop: {}", self.path.display(), e);
        }
    }
}
