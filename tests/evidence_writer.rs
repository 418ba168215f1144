use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eyespy_kernel::evidence::AUDIT_HEADER;
use eyespy_kernel::{
    DetectionBox, DetectionProcessor, Entity, FilesystemEvidenceWriter, Frame, RetentionLedger,
    RetentionPolicy, SpatialIndex,
};

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
}

fn processor(flagged: &std::path::Path, log: &std::path::Path, capacity: usize) -> DetectionProcessor {
    let writer = FilesystemEvidenceWriter::new(flagged, log).expect("writer");
    let policy = RetentionPolicy {
        capacity,
        ..RetentionPolicy::default()
    };
    let ledger = RetentionLedger::new(policy, Box::new(writer)).expect("ledger");
    let index = SpatialIndex::from_entities([Entity::new("21CS001", "Ada Lovelace", 10.0, 10.0)])
        .expect("index");
    DetectionProcessor::new(Arc::new(index), Arc::new(ledger), Default::default())
}

#[test]
fn evicted_artifacts_leave_the_disk_and_audit_rows_stay() {
    let dir = tempfile::tempdir().expect("tempdir");
    let flagged = dir.path().join("flagged");
    let log = dir.path().join("flagged_log.csv");
    let processor = processor(&flagged, &log, 1);
    let frame = Frame::synthetic(40, 30, 1).expect("frame");

    let weak = processor
        .process_frame(
            &frame,
            &[DetectionBox::new(5.0, 5.0, 15.0, 15.0, 0.4)],
            "hall.mp4@3",
            at(0),
        )
        .expect("first");
    assert_eq!(weak.len(), 1);
    let entity_dir = flagged.join("Ada_Lovelace_21CS001");
    let weak_file = entity_dir.join("top_1_Ada_Lovelace_1700000000.jpg");
    assert!(weak_file.is_file());

    processor
        .process_frame(
            &frame,
            &[DetectionBox::new(5.0, 5.0, 15.0, 15.0, 0.8)],
            "hall.mp4@90",
            at(5),
        )
        .expect("second");
    assert!(!weak_file.exists());
    let strong_file = entity_dir.join("top_2_Ada_Lovelace_1700000005.jpg");
    let image = image::open(&strong_file).expect("decode jpeg").to_rgb8();
    assert_eq!(image.dimensions(), (40, 30));

    let csv = fs::read_to_string(&log).expect("read log");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], AUDIT_HEADER);
    // Eviction never rewrites the log.
    assert_eq!(lines.len(), 3);
    assert!(lines[1].contains("hall.mp4@3"));
    assert!(lines[1].contains(",Ada Lovelace,21CS001,0.4000,10.0,10.0"));
    assert!(lines[2].contains("hall.mp4@90"));
}

#[test]
fn reopening_the_log_appends_without_a_second_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    let flagged = dir.path().join("flagged");
    let log = dir.path().join("audit").join("log.csv");
    let frame = Frame::synthetic(20, 20, 0).expect("frame");
    let bbox = DetectionBox::new(8.0, 8.0, 12.0, 12.0, 0.7);

    for round in 0..2u64 {
        let processor = processor(&flagged, &log, 20);
        processor
            .process_frame(&frame, &[bbox], "cam@1", at(round * 10))
            .expect("process");
        processor.ledger().flush().expect("flush");
    }

    let csv = fs::read_to_string(&log).expect("read log");
    assert_eq!(csv.matches(AUDIT_HEADER).count(), 1);
    assert_eq!(csv.lines().count(), 3);
}

#[test]
fn sample_writes_annotated_frame_outside_top_n() {
    let dir = tempfile::tempdir().expect("tempdir");
    let flagged = dir.path().join("flagged");
    let log = dir.path().join("log.csv");
    let processor = processor(&flagged, &log, 20);
    let frame = Frame::synthetic(30, 30, 0).expect("frame");

    let outcome = processor
        .process_sample(
            &frame,
            &[
                DetectionBox::new(6.0, 6.0, 14.0, 14.0, 0.9),
                DetectionBox::new(20.0, 20.0, 28.0, 28.0, 0.5),
            ],
            at(42),
        )
        .expect("sample");
    let path = outcome.artifact.expect("sample written");
    assert_eq!(path, flagged.join("flagged_sample_1700000042.jpg"));
    assert!(path.is_file());
    assert_eq!(outcome.flagged.len(), 1);
    assert!(processor.ledger().is_empty());

    let csv = fs::read_to_string(&log).expect("read log");
    let rows: Vec<&str> = csv.lines().skip(1).collect();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].contains(",sample,Ada Lovelace,21CS001,0.9000,"));
}
