//! sample_detect - grab one frame from a source, run the detector once and
//! save an annotated sample with its audit rows.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use eyespy_kernel::config::MonitorConfig;
use eyespy_kernel::ui::{Ui, UiMode};
use eyespy_kernel::{
    DetectionBox, DetectionProcessor, FilesystemEvidenceWriter, FrameSampler, RetentionLedger,
    SourceDescriptor, SpatialIndex,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// images:<dir>, videos:<dir>, video:<file> or camera:<index>.
    #[arg(long)]
    source: SourceDescriptor,
    /// Config file (JSON or .toml); overrides EYESPY_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Box emitted by the stub detector (x1,y1,x2,y2,confidence).
    #[arg(long = "stub-box")]
    stub_boxes: Vec<DetectionBox>,
    /// Seed for reproducible frame selection.
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::for_stderr(args.ui);

    let cfg = match &args.config {
        Some(path) => MonitorConfig::load_from(path)?,
        None => MonitorConfig::load()?,
    };

    let sampled = {
        let stage = ui.stage("sample frame");
        let mut sampler = match args.seed {
            Some(seed) => FrameSampler::with_seed(seed),
            None => FrameSampler::new(),
        };
        match sampler.sample(&args.source) {
            Ok(sampled) => sampled,
            Err(e) => {
                stage.fail();
                return Err(e);
            }
        }
    };
    println!("sampled {}", sampled.description);

    let boxes = {
        let _stage = ui.stage("detect");
        let registry = cfg.detector.build_registry(args.stub_boxes.clone())?;
        if registry.default_backend().is_none() {
            return Err(anyhow!("no detector backend available"));
        }
        registry.detect(&sampled.frame, cfg.pipeline.confidence_threshold)?
    };
    println!("{} detection(s) at or above {:.2}", boxes.len(), cfg.pipeline.confidence_threshold);

    let outcome = {
        let _stage = ui.stage("save sample");
        let writer = FilesystemEvidenceWriter::new(cfg.output.flagged_dir(), cfg.output.audit_log())?
            .with_jpeg_quality(cfg.output.jpeg_quality);
        let ledger = RetentionLedger::new(cfg.retention.clone(), Box::new(writer))?;
        let index = SpatialIndex::from_entities(cfg.entities.iter().cloned())?;
        let processor =
            DetectionProcessor::new(Arc::new(index), Arc::new(ledger), cfg.association.clone());
        processor.process_sample(&sampled.frame, &boxes, SystemTime::now())?
    };

    match &outcome.artifact {
        Some(path) => println!("annotated sample: {}", path.display()),
        None => println!("annotated sample could not be written"),
    }
    if outcome.flagged.is_empty() {
        println!("no entities near any detection");
    }
    for flag in &outcome.flagged {
        let (cx, cy) = flag.bbox.center();
        println!(
            "  {} ({}) confidence {:.2} at ({:.0}, {:.0})",
            flag.display_name, flag.entity_id, flag.bbox.confidence, cx, cy
        );
    }
    Ok(())
}
