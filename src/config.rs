use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{BackendRegistry, StubBackend};
use crate::frame::DetectionBox;
use crate::pipeline::{OverflowPolicy, PipelineConfig};
use crate::processor::AssociationConfig;
use crate::retention::RetentionPolicy;
use crate::Entity;

const DEFAULT_OUTPUT_DIR: &str = "eyespy_output";
const DEFAULT_FLAGGED_SUBDIR: &str = "flagged";
const DEFAULT_AUDIT_LOG: &str = "flagged_log.csv";
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_CONSUMER_POLL_MS: u64 = 30;
const DEFAULT_MODEL_INPUT: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    output: Option<OutputConfigFile>,
    retention: Option<RetentionConfigFile>,
    association: Option<AssociationConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    detector: Option<DetectorConfigFile>,
    entities: Option<Vec<EntityConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    flagged_dir: Option<PathBuf>,
    audit_log: Option<PathBuf>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    top_n: Option<usize>,
    max_entries_per_entity: Option<usize>,
    min_gap_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct AssociationConfigFile {
    k: Option<usize>,
    radius_factor: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    queue_capacity: Option<usize>,
    overflow: Option<OverflowPolicy>,
    pause_poll_ms: Option<u64>,
    consumer_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EntityConfigFile {
    id: String,
    name: String,
    x: f32,
    y: f32,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub output: OutputSettings,
    pub retention: RetentionPolicy,
    pub association: AssociationConfig,
    pub pipeline: PipelineConfig,
    /// How often the controller polls the frame channel.
    pub consumer_poll: Duration,
    pub detector: DetectorSettings,
    /// Entities placed before the first frame.
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub dir: PathBuf,
    flagged_dir: Option<PathBuf>,
    audit_log: Option<PathBuf>,
    pub jpeg_quality: u8,
}

impl OutputSettings {
    /// Explicit `flagged_dir`, else `<dir>/flagged`.
    pub fn flagged_dir(&self) -> PathBuf {
        self.flagged_dir
            .clone()
            .unwrap_or_else(|| self.dir.join(DEFAULT_FLAGGED_SUBDIR))
    }

    /// Explicit `audit_log`, else `<dir>/flagged_log.csv`.
    pub fn audit_log(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| self.dir.join(DEFAULT_AUDIT_LOG))
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// ONNX model for the tract backend; the stub backend is used when unset.
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
}

impl DetectorSettings {
    /// Registry with the configured backend as default.
    ///
    /// A model path selects the tract backend; without one (or without the
    /// `backend-tract` feature) a stub emitting `stub_boxes` is used.
    pub fn build_registry(&self, stub_boxes: Vec<DetectionBox>) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        match &self.model_path {
            #[cfg(feature = "backend-tract")]
            Some(path) => {
                let backend =
                    crate::detect::TractBackend::new(path, self.input_width, self.input_height)?;
                registry.register(backend);
            }
            #[cfg(not(feature = "backend-tract"))]
            Some(path) => {
                log::warn!(
                    "model {} ignored: built without backend-tract; using stub detector",
                    path.display()
                );
                registry.register(StubBackend::with_boxes(stub_boxes));
            }
            None => registry.register(StubBackend::with_boxes(stub_boxes)),
        }
        Ok(registry)
    }
}

impl MonitorConfig {
    /// Defaults, then the file named by `EYESPY_CONFIG`, then `EYESPY_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EYESPY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file, ignoring `EYESPY_CONFIG` but still applying overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Result<Self> {
        let output_file = file.output.unwrap_or_default();
        let output = OutputSettings {
            dir: output_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            flagged_dir: output_file.flagged_dir,
            audit_log: output_file.audit_log,
            jpeg_quality: output_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let defaults = RetentionPolicy::default();
        let retention_file = file.retention.unwrap_or_default();
        let min_gap = match retention_file.min_gap_secs {
            Some(secs) => duration_from_secs(secs, "retention.min_gap_secs")?,
            None => defaults.min_gap,
        };
        let retention = RetentionPolicy {
            capacity: retention_file.top_n.unwrap_or(defaults.capacity),
            max_entries_per_entity: retention_file
                .max_entries_per_entity
                .unwrap_or(defaults.max_entries_per_entity),
            min_gap,
        };

        let association_defaults = AssociationConfig::default();
        let association_file = file.association.unwrap_or_default();
        let association = AssociationConfig {
            k: association_file.k.unwrap_or(association_defaults.k),
            radius_factor: association_file
                .radius_factor
                .unwrap_or(association_defaults.radius_factor),
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline_file = file.pipeline.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        let pipeline = PipelineConfig {
            queue_capacity: pipeline_file
                .queue_capacity
                .unwrap_or(pipeline_defaults.queue_capacity),
            overflow: pipeline_file.overflow.unwrap_or(pipeline_defaults.overflow),
            pause_poll_ms: pipeline_file
                .pause_poll_ms
                .unwrap_or(pipeline_defaults.pause_poll_ms),
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(pipeline_defaults.confidence_threshold),
        };
        let consumer_poll = Duration::from_millis(
            pipeline_file
                .consumer_poll_ms
                .unwrap_or(DEFAULT_CONSUMER_POLL_MS),
        );

        let detector = DetectorSettings {
            model_path: detector_file.model_path,
            input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
        };

        let entities = file
            .entities
            .unwrap_or_default()
            .into_iter()
            .map(|e| Entity::new(e.id, e.name, e.x, e.y))
            .collect();

        Ok(Self {
            output,
            retention,
            association,
            pipeline,
            consumer_poll,
            detector,
            entities,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("EYESPY_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output.dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("EYESPY_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        if let Some(top_n) = parse_env::<usize>("EYESPY_TOP_N", "an integer")? {
            self.retention.capacity = top_n;
        }
        if let Some(max) = parse_env::<usize>("EYESPY_MAX_ENTRIES", "an integer")? {
            self.retention.max_entries_per_entity = max;
        }
        if let Some(secs) = parse_env::<f64>("EYESPY_MIN_GAP_SECS", "a number of seconds")? {
            self.retention.min_gap = duration_from_secs(secs, "EYESPY_MIN_GAP_SECS")?;
        }
        if let Some(threshold) = parse_env::<f32>("EYESPY_CONF_THRESHOLD", "a number")? {
            self.pipeline.confidence_threshold = threshold;
        }
        if let Some(capacity) = parse_env::<usize>("EYESPY_QUEUE_CAPACITY", "an integer")? {
            self.pipeline.queue_capacity = capacity;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.retention.validate()?;
        self.pipeline.validate()?;

        if self.association.k == 0 {
            return Err(anyhow!("association.k must be at least 1"));
        }
        if !self.association.radius_factor.is_finite() || self.association.radius_factor <= 0.0 {
            return Err(anyhow!("association.radius_factor must be positive"));
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(anyhow!("output.jpeg_quality must be within 1..=100"));
        }
        if self.consumer_poll.is_zero() {
            return Err(anyhow!("pipeline.consumer_poll_ms must be greater than zero"));
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input dimensions must be non-zero"));
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            crate::validate_entity_id(&entity.id)?;
            if !seen.insert(entity.id.as_str()) {
                return Err(anyhow!("duplicate entity id '{}'", entity.id));
            }
        }
        Ok(())
    }
}

/// `.toml` files are parsed as TOML, everything else as JSON.
fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_env<T: std::str::FromStr>(key: &str, expected: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", key, expected)),
        _ => Ok(None),
    }
}

fn duration_from_secs(secs: f64, field: &str) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("{} must be a non-negative number of seconds", field));
    }
    Ok(Duration::from_secs_f64(secs))
}
