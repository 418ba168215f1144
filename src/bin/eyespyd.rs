//! eyespyd - EyeSpy monitor daemon
//!
//! This daemon:
//! 1. Loads entity positions and limits from config (`EYESPY_CONFIG`, `EYESPY_*`)
//! 2. Streams one source through the detector on a producer thread
//! 3. Associates detections with nearby entities and keeps the top-N evidence frames
//! 4. Appends every admitted flag to the audit CSV
//! 5. Stops cleanly on Ctrl-C and prints a per-entity summary

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyespy_kernel::config::MonitorConfig;
use eyespy_kernel::ui::{Ui, UiMode};
use eyespy_kernel::{
    DetectionBox, DetectionProcessor, FilesystemEvidenceWriter, PipelineState, RetentionLedger,
    SourceDescriptor, SpatialIndex, StreamPipeline,
};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Source to monitor: images:<dir>, videos:<dir>, video:<file> or camera:<index>.
    #[arg(long)]
    source: SourceDescriptor,
    /// Config file (JSON or .toml); overrides EYESPY_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Box emitted by the stub detector on every frame (x1,y1,x2,y2,confidence).
    #[arg(long = "stub-box")]
    stub_boxes: Vec<DetectionBox>,
    /// Stop after this many seconds.
    #[arg(long)]
    max_seconds: Option<u64>,
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::for_stderr(args.ui);

    let cfg = match &args.config {
        Some(path) => MonitorConfig::load_from(path)?,
        None => MonitorConfig::load()?,
    };
    if cfg.entities.is_empty() {
        log::warn!("no entities configured; detections will not be attributed to anyone");
    }

    let (mut pipeline, flagged_dir, audit_log) = {
        let _stage = ui.stage("prepare monitor");
        let flagged_dir = cfg.output.flagged_dir();
        let audit_log = cfg.output.audit_log();
        let writer = FilesystemEvidenceWriter::new(&flagged_dir, &audit_log)?
            .with_jpeg_quality(cfg.output.jpeg_quality);
        let ledger = RetentionLedger::new(cfg.retention.clone(), Box::new(writer))?;
        let index = SpatialIndex::from_entities(cfg.entities.iter().cloned())?;
        let processor = Arc::new(DetectionProcessor::new(
            Arc::new(index),
            Arc::new(ledger),
            cfg.association.clone(),
        ));
        let registry = cfg.detector.build_registry(args.stub_boxes.clone())?;
        let detector = registry
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend available"))?;
        log::info!("detector backends: {:?}", registry.list());
        let pipeline = StreamPipeline::new(cfg.pipeline.clone(), detector, processor)?;
        (pipeline, flagged_dir, audit_log)
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    pipeline.start(&args.source)?;
    log::info!(
        "eyespyd running on {}; evidence in {}, audit log {}",
        args.source,
        flagged_dir.display(),
        audit_log.display()
    );
    log::info!(
        "top_n={} min_gap={:?} max_entries_per_entity={} k={} radius_factor={}",
        cfg.retention.capacity,
        cfg.retention.min_gap,
        cfg.retention.max_entries_per_entity,
        cfg.association.k,
        cfg.association.radius_factor
    );

    let started = Instant::now();
    let deadline = args.max_seconds.map(Duration::from_secs);
    let mut status = ui.status("waiting for frames");
    let mut events = 0u64;

    loop {
        // Sampled before draining so frames pushed just before exit are shown.
        let exhausted = pipeline.state() == PipelineState::Idle;
        while let Some(event) = pipeline.poll()? {
            events += 1;
            for flag in &event.flagged {
                log::info!(
                    "{} flagged on {}@{} (confidence {:.2})",
                    flag.display_name,
                    event.source_name,
                    event.frame_index,
                    flag.confidence
                );
            }
        }

        let stats = pipeline.stats();
        status.update(&format!(
            "frames {} | shown {} | dropped {} | flags {} | retained {}",
            stats.frames_read,
            events,
            stats.frames_dropped,
            stats.flags_raised,
            pipeline.processor().ledger().len()
        ));

        if exhausted {
            log::info!("source exhausted");
            break;
        }
        let timed_out = deadline.is_some_and(|limit| started.elapsed() >= limit);
        if interrupted.load(Ordering::SeqCst) || timed_out {
            log::info!("stopping monitor");
            pipeline.stop();
            if !pipeline.wait_idle(STOP_GRACE) {
                log::warn!("producer did not exit within {:?}; terminating", STOP_GRACE);
                pipeline.terminate();
            }
            break;
        }
        std::thread::sleep(cfg.consumer_poll);
    }

    let stats = pipeline.stats();
    status.finish(&format!(
        "done: {} frames, {} flags, {} detector failures",
        stats.frames_read, stats.flags_raised, stats.detector_failures
    ));

    let ledger = pipeline.processor().ledger();
    ledger.flush()?;
    let summary = ledger.flagged_summary()?;
    if summary.is_empty() {
        println!("no entities flagged");
    } else {
        println!("flagged entities:");
        for (entity_id, entry) in &summary {
            println!(
                "  {} ({}): {} retained, best confidence {:.2}",
                entry.display_name, entity_id, entry.count, entry.best_confidence
            );
        }
    }
    Ok(())
}
