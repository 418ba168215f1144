use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use image::RgbImage;

use eyespy_kernel::detect::SharedDetector;
use eyespy_kernel::{
    DetectionBox, DetectionProcessor, Entity, InMemoryEvidenceStore, OverflowPolicy,
    PipelineConfig, PipelineState, RetentionLedger, RetentionPolicy, ScriptStep, ScriptedBackend,
    SourceDescriptor, SourceUnavailable, SpatialIndex, StreamPipeline, StubBackend,
};

const WAIT: Duration = Duration::from_secs(10);

fn processor(store: &InMemoryEvidenceStore) -> Arc<DetectionProcessor> {
    let index = SpatialIndex::from_entities([
        Entity::new("S1", "Ada", 8.0, 8.0),
        Entity::new("S2", "Grace", 24.0, 8.0),
    ])
    .expect("index");
    let policy = RetentionPolicy {
        min_gap: Duration::ZERO,
        ..RetentionPolicy::default()
    };
    let ledger = RetentionLedger::new(policy, Box::new(store.clone())).expect("ledger");
    Arc::new(DetectionProcessor::new(
        Arc::new(index),
        Arc::new(ledger),
        Default::default(),
    ))
}

fn config(queue_capacity: usize, overflow: OverflowPolicy) -> PipelineConfig {
    PipelineConfig {
        queue_capacity,
        overflow,
        pause_poll_ms: 10,
        ..PipelineConfig::default()
    }
}

fn near_ada(confidence: f32) -> DetectionBox {
    DetectionBox::new(4.0, 4.0, 12.0, 12.0, confidence)
}

fn stub_detector(boxes: Vec<DetectionBox>) -> SharedDetector {
    Arc::new(Mutex::new(StubBackend::with_boxes(boxes)))
}

/// Streams ten PNGs with the detector misbehaving on the fifth call and
/// checks the other nine frames are still processed.
fn stream_survives_bad_fifth_frame(bad_step: ScriptStep) {
    let dir = tempfile::tempdir().expect("tempdir");
    for i in 1..=10u8 {
        RgbImage::from_pixel(32, 16, image::Rgb([i, i, i]))
            .save(dir.path().join(format!("frame_{:02}.png", i)))
            .expect("write png");
    }

    let mut steps: Vec<ScriptStep> = (1..=10)
        .map(|i| ScriptStep::Boxes(vec![near_ada(0.5 + i as f32 / 100.0)]))
        .collect();
    steps[4] = bad_step;
    let scripted = Arc::new(Mutex::new(ScriptedBackend::new(steps)));
    let detector: SharedDetector = scripted.clone();

    let store = InMemoryEvidenceStore::new();
    let mut pipeline = StreamPipeline::new(
        config(16, OverflowPolicy::DropNewest),
        detector,
        processor(&store),
    )
    .expect("pipeline");

    pipeline
        .start(&SourceDescriptor::ImageFolder(dir.path().to_path_buf()))
        .expect("start");
    assert!(pipeline.wait_idle(WAIT), "producer did not finish");
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let events = pipeline.drain().expect("drain");
    assert_eq!(events.len(), 10);
    let names: Vec<&str> = events.iter().map(|e| e.source_name.as_str()).collect();
    assert_eq!(names[0], "frame_01.png");
    assert_eq!(names[9], "frame_10.png");
    for (i, event) in events.iter().enumerate() {
        if i == 4 {
            assert!(event.detections.is_empty());
            assert!(event.flagged.is_empty());
        } else {
            assert_eq!(event.detections.len(), 1, "frame {}", i + 1);
            assert_eq!(event.flagged.len(), 1, "frame {}", i + 1);
            assert_eq!(event.flagged[0].entity_id, "S1");
        }
    }

    let backend = scripted.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(backend.calls(), 10);
    let stats = pipeline.stats();
    assert_eq!(stats.frames_read, 10);
    assert_eq!(stats.detector_failures, 1);
    assert_eq!(stats.flags_raised, 9);
    assert_eq!(stats.sources_completed, 10);

    let ledger = pipeline.processor().ledger();
    assert_eq!(ledger.len(), 9);
    let rows = store.rows();
    assert_eq!(rows.len(), 9);
    assert!(rows.iter().all(|r| r.source_info.ends_with("@1")));
    assert!(store.flush_count() > 0);
}

#[test]
fn detector_failure_on_one_frame_does_not_stop_the_stream() {
    stream_survives_bad_fifth_frame(ScriptStep::Fail("inference crashed".to_string()));
}

#[test]
fn detector_panic_on_one_frame_does_not_stop_the_stream() {
    stream_survives_bad_fifth_frame(ScriptStep::Panic("tensor shape mismatch".to_string()));
}

#[test]
fn full_channel_keeps_only_the_freshest_frame() {
    let store = InMemoryEvidenceStore::new();
    let mut pipeline = StreamPipeline::new(
        config(1, OverflowPolicy::DropOldest),
        stub_detector(Vec::new()),
        processor(&store),
    )
    .expect("pipeline");

    pipeline
        .start(&"video:stub://hall?frames=5&width=8&height=8&fps=1000".parse().expect("descriptor"))
        .expect("start");
    assert!(pipeline.wait_idle(WAIT));

    let event = pipeline.poll().expect("poll").expect("one frame queued");
    assert_eq!(event.frame_index, 5);
    assert_eq!(event.source_name, "hall");
    assert!(pipeline.poll().expect("poll").is_none());
    assert_eq!(pipeline.stats().frames_dropped, 4);
}

#[test]
fn pause_stalls_the_producer_until_resumed() {
    let store = InMemoryEvidenceStore::new();
    let mut pipeline = StreamPipeline::new(
        config(4, OverflowPolicy::DropOldest),
        stub_detector(vec![near_ada(0.9)]),
        processor(&store),
    )
    .expect("pipeline");
    let source: SourceDescriptor = "video:stub://long?frames=100000&width=32&height=16&fps=1000"
        .parse()
        .expect("descriptor");

    pipeline.start(&source).expect("start");
    thread::sleep(Duration::from_millis(50));
    pipeline.pause();
    assert_eq!(pipeline.state(), PipelineState::Paused);

    // Let any in-flight iteration finish.
    thread::sleep(Duration::from_millis(50));
    let paused_at = pipeline.stats().frames_read;
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pipeline.stats().frames_read, paused_at);

    // Start while paused resumes.
    pipeline.start(&source).expect("resume via start");
    assert_eq!(pipeline.state(), PipelineState::Running);
    thread::sleep(Duration::from_millis(100));
    assert!(pipeline.stats().frames_read > paused_at);

    // Start while running is a no-op.
    pipeline.start(&source).expect("second start");
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.stop();
    assert!(pipeline.wait_idle(WAIT));
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let ledger = pipeline.processor().ledger();
    assert!(ledger.len() <= ledger.capacity());
    assert!(ledger.history("S1").expect("history").len() <= 50);
    assert!(store.flush_count() > 0);
}

#[test]
fn unavailable_source_leaves_pipeline_idle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = InMemoryEvidenceStore::new();
    let mut pipeline = StreamPipeline::new(
        PipelineConfig::default(),
        stub_detector(Vec::new()),
        processor(&store),
    )
    .expect("pipeline");

    for descriptor in [
        SourceDescriptor::ImageFolder(dir.path().join("missing")),
        SourceDescriptor::ImageFolder(dir.path().to_path_buf()),
        SourceDescriptor::VideoFile(dir.path().join("absent.mp4")),
    ] {
        let err = pipeline.start(&descriptor).expect_err("unavailable");
        assert!(
            err.downcast_ref::<SourceUnavailable>().is_some(),
            "{}: {:#}",
            descriptor,
            err
        );
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }
}

#[test]
fn terminate_is_reported_until_the_next_start() {
    let store = InMemoryEvidenceStore::new();
    let mut pipeline = StreamPipeline::new(
        config(4, OverflowPolicy::DropOldest),
        stub_detector(Vec::new()),
        processor(&store),
    )
    .expect("pipeline");
    let source: SourceDescriptor = "video:stub://gate?frames=100000&width=8&height=8&fps=1000"
        .parse()
        .expect("descriptor");

    pipeline.start(&source).expect("start");
    thread::sleep(Duration::from_millis(30));
    pipeline.terminate();
    assert_eq!(pipeline.state(), PipelineState::Terminated);
    assert!(pipeline.wait_idle(WAIT));
    assert_eq!(pipeline.state(), PipelineState::Terminated);

    pipeline.start(&source).expect("restart");
    assert_eq!(pipeline.state(), PipelineState::Running);
    pipeline.stop();
    assert!(pipeline.wait_idle(WAIT));
}

#[test]
fn terminate_while_idle_changes_nothing() {
    let store = InMemoryEvidenceStore::new();
    let mut pipeline = StreamPipeline::new(
        config(4, OverflowPolicy::DropOldest),
        stub_detector(Vec::new()),
        processor(&store),
    )
    .expect("pipeline");

    pipeline.terminate();
    assert_eq!(pipeline.state(), PipelineState::Idle);

    pipeline
        .start(&"video:stub://door?frames=3&width=8&height=8&fps=1000".parse().expect("descriptor"))
        .expect("start");
    assert!(pipeline.wait_idle(WAIT));
    assert_eq!(pipeline.state(), PipelineState::Idle);
    pipeline.terminate();
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.drain().expect("drain").len(), 3);
}
