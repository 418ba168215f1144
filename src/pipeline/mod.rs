//! Producer/consumer streaming over one source.
//!
//! One producer thread per active source decodes frames, runs the detector,
//! applies association + retention inline and pushes a `FrameEvent` onto a
//! bounded `FrameChannel`. The controlling thread polls the channel without
//! blocking and never re-runs retention.
//!
//! Cancellation is cooperative: pause/stop flags are checked once per loop
//! iteration, so a slow `detect` call always finishes first. Neither `stop`
//! nor `terminate` waits for the producer; use `wait_idle` for that.

mod channel;

pub use channel::{FrameChannel, OverflowPolicy, PushOutcome};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::detect::{detect_filtered, SharedDetector};
use crate::frame::{DetectionBox, Frame};
use crate::ingest::{SourceCursor, SourceDescriptor, DEFAULT_FPS};
use crate::processor::{DetectionProcessor, Flag};

// ----------------------------------------------------------------------------
// Configuration and public types
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Producer sleep while paused.
    pub pause_poll_ms: u64,
    /// Boxes below this confidence are dropped at the detector adapter.
    pub confidence_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            overflow: OverflowPolicy::default(),
            pause_poll_ms: 150,
            confidence_threshold: 0.3,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        if self.pause_poll_ms == 0 {
            return Err(anyhow!("pause_poll_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    /// Stop requested; the producer has not exited yet.
    Stopping,
    /// Terminate requested. Reported until the next successful `start`.
    Terminated,
}

/// One decoded frame with its detections, as handed to the consumer.
#[derive(Clone, Debug)]
pub struct FrameEvent {
    pub frame: Frame,
    pub source_name: String,
    /// 1-based index within the concrete source.
    pub frame_index: u64,
    pub detections: Vec<DetectionBox>,
    /// Entities flagged by detections admitted on this frame.
    pub flagged: Vec<Flag>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_read: u64,
    pub frames_pushed: u64,
    pub frames_dropped: u64,
    pub detector_failures: u64,
    pub flags_raised: u64,
    pub sources_completed: u64,
}

// ----------------------------------------------------------------------------
// Shared controls
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Controls {
    stop: AtomicBool,
    pause: AtomicBool,
    terminate: AtomicBool,
    /// True while a producer thread exists.
    alive: AtomicBool,
    frames_read: AtomicU64,
    frames_pushed: AtomicU64,
    detector_failures: AtomicU64,
    flags_raised: AtomicU64,
    sources_completed: AtomicU64,
}

impl Controls {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Clears `alive` when the producer exits, including by panic.
struct AliveGuard(Arc<Controls>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct StreamPipeline {
    config: PipelineConfig,
    detector: SharedDetector,
    processor: Arc<DetectionProcessor>,
    channel: Arc<FrameChannel<FrameEvent>>,
    controls: Arc<Controls>,
    state: PipelineState,
    worker: Option<JoinHandle<()>>,
}

impl StreamPipeline {
    pub fn new(
        config: PipelineConfig,
        detector: SharedDetector,
        processor: Arc<DetectionProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let channel = Arc::new(FrameChannel::new(config.queue_capacity, config.overflow)?);
        Ok(Self {
            config,
            detector,
            processor,
            channel,
            controls: Arc::new(Controls::default()),
            state: PipelineState::Idle,
            worker: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<DetectionProcessor> {
        &self.processor
    }

    fn producer_alive(&self) -> bool {
        self.controls.alive.load(Ordering::SeqCst)
    }

    /// Current state. A producer that exited on its own (source exhausted, or
    /// after a stop) reads as `Idle`.
    pub fn state(&self) -> PipelineState {
        match self.state {
            PipelineState::Running | PipelineState::Paused | PipelineState::Stopping
                if !self.producer_alive() =>
            {
                PipelineState::Idle
            }
            other => other,
        }
    }

    /// Start streaming from `descriptor`.
    ///
    /// Paused: resumes and returns. Running: no-op. A producer from an earlier
    /// run that has not exited yet: error. Otherwise exactly one producer is
    /// spawned; it opens the source and reports back before `start` returns.
    /// An unopenable source yields a `SourceUnavailable` error and the
    /// pipeline stays `Idle`.
    pub fn start(&mut self, descriptor: &SourceDescriptor) -> Result<()> {
        match self.state() {
            PipelineState::Paused => {
                self.resume();
                return Ok(());
            }
            PipelineState::Running => {
                log::info!("pipeline already running; ignoring start for {}", descriptor);
                return Ok(());
            }
            _ => {}
        }
        if self.producer_alive() {
            return Err(anyhow!(
                "previous producer has not exited yet; wait for it before starting {}",
                descriptor
            ));
        }
        self.reap();

        self.controls.stop.store(false, Ordering::SeqCst);
        self.controls.pause.store(false, Ordering::SeqCst);
        self.controls.terminate.store(false, Ordering::SeqCst);
        self.channel.clear()?;

        let (open_tx, open_rx) = mpsc::sync_channel::<Result<()>>(1);
        let ctx = ProducerContext {
            detector: self.detector.clone(),
            processor: self.processor.clone(),
            channel: self.channel.clone(),
            controls: self.controls.clone(),
            confidence_threshold: self.config.confidence_threshold,
            pause_poll: Duration::from_millis(self.config.pause_poll_ms),
        };
        let descriptor_owned = descriptor.clone();

        self.controls.alive.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("eyespy-producer".to_string())
            .spawn(move || {
                let _alive = AliveGuard(ctx.controls.clone());
                match SourceCursor::open(&descriptor_owned) {
                    Ok(cursor) => {
                        let _ = open_tx.send(Ok(()));
                        run_producer(cursor, &ctx);
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                    }
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.controls.alive.store(false, Ordering::SeqCst);
                return Err(e).context("failed to spawn producer thread");
            }
        };

        let opened = open_rx.recv();
        match opened {
            Ok(Ok(())) => {
                self.worker = Some(handle);
                self.state = PipelineState::Running;
                log::info!("pipeline started on {}", descriptor);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                self.state = PipelineState::Idle;
                log::warn!("pipeline failed to start: {:#}", e);
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                self.state = PipelineState::Idle;
                Err(anyhow!("producer exited before opening {}", descriptor))
            }
        }
    }

    /// Producer stops reading; the source cursor stalls in place.
    pub fn pause(&mut self) {
        if self.state() == PipelineState::Running {
            self.controls.pause.store(true, Ordering::SeqCst);
            self.state = PipelineState::Paused;
            log::info!("pipeline paused");
        }
    }

    pub fn resume(&mut self) {
        if self.state() == PipelineState::Paused {
            self.controls.pause.store(false, Ordering::SeqCst);
            self.state = PipelineState::Running;
            log::info!("pipeline resumed");
        }
    }

    pub fn toggle_pause(&mut self) {
        match self.state() {
            PipelineState::Running => self.pause(),
            PipelineState::Paused => self.resume(),
            _ => {}
        }
    }

    /// Cooperative stop. The producer finishes its current iteration, releases
    /// the source and flushes the audit log. Does not wait.
    pub fn stop(&mut self) {
        if matches!(
            self.state(),
            PipelineState::Running | PipelineState::Paused
        ) {
            self.controls.stop.store(true, Ordering::SeqCst);
            self.controls.pause.store(false, Ordering::SeqCst);
            self.state = PipelineState::Stopping;
            log::info!("pipeline stop requested");
        }
    }

    /// Best-effort teardown: sets the stop flag, discards queued frames and
    /// detaches the producer. Resources are released only when the producer
    /// next observes the flag, which may be after this returns. No-op unless
    /// running, paused or stopping.
    pub fn terminate(&mut self) {
        if !matches!(
            self.state(),
            PipelineState::Running | PipelineState::Paused | PipelineState::Stopping
        ) {
            return;
        }
        self.controls.terminate.store(true, Ordering::SeqCst);
        self.controls.stop.store(true, Ordering::SeqCst);
        self.controls.pause.store(false, Ordering::SeqCst);
        if let Err(e) = self.channel.clear() {
            log::warn!("failed to clear frame channel on terminate: {:#}", e);
        }
        // Detach.
        self.worker.take();
        self.state = PipelineState::Terminated;
        log::info!("pipeline terminated");
    }

    /// Block until the producer has exited or `timeout` elapses. Returns
    /// whether the producer is gone.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.producer_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.reap();
        true
    }

    /// Next queued frame, if any. Never blocks.
    pub fn poll(&self) -> Result<Option<FrameEvent>> {
        self.channel.try_pop()
    }

    /// All queued frames, oldest first. Never blocks.
    pub fn drain(&self) -> Result<Vec<FrameEvent>> {
        self.channel.drain()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.controls;
        PipelineStats {
            frames_read: c.frames_read.load(Ordering::Relaxed),
            frames_pushed: c.frames_pushed.load(Ordering::Relaxed),
            frames_dropped: self.channel.dropped(),
            detector_failures: c.detector_failures.load(Ordering::Relaxed),
            flags_raised: c.flags_raised.load(Ordering::Relaxed),
            sources_completed: c.sources_completed.load(Ordering::Relaxed),
        }
    }

    fn reap(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("producer thread panicked");
            }
        }
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        // Never block on a slow detector here.
        self.controls.stop.store(true, Ordering::SeqCst);
        self.controls.pause.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Producer
// ----------------------------------------------------------------------------

struct ProducerContext {
    detector: SharedDetector,
    processor: Arc<DetectionProcessor>,
    channel: Arc<FrameChannel<FrameEvent>>,
    controls: Arc<Controls>,
    confidence_threshold: f32,
    pause_poll: Duration,
}

fn pacing_delay(fps: f64) -> Duration {
    let fps = if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        DEFAULT_FPS
    };
    Duration::from_secs_f64((0.5 / fps).max(0.001))
}

fn run_producer(mut cursor: SourceCursor, ctx: &ProducerContext) {
    let controls = &ctx.controls;

    'sources: while let Some(mut source) = cursor.next_source() {
        if controls.stopping() {
            break;
        }
        let name = source.name().to_string();
        let pacing = pacing_delay(source.fps().unwrap_or(DEFAULT_FPS));
        log::info!("reading {}", name);

        loop {
            if controls.stopping() {
                break 'sources;
            }
            if controls.pause.load(Ordering::SeqCst) {
                thread::sleep(ctx.pause_poll);
                continue;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("decode failed on {}; moving on: {:#}", name, e);
                    break;
                }
            };
            let frame_index = source.frames_read();
            controls.frames_read.fetch_add(1, Ordering::Relaxed);
            let label = format!("{}@{}", name, frame_index);

            let detections = match detect_filtered(&ctx.detector, &frame, ctx.confidence_threshold)
            {
                Ok(boxes) => boxes,
                Err(e) => {
                    controls.detector_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("detector failed on {}: {:#}", label, e);
                    Vec::new()
                }
            };

            let flagged = if detections.is_empty() {
                Vec::new()
            } else {
                match ctx
                    .processor
                    .process_frame(&frame, &detections, &label, SystemTime::now())
                {
                    Ok(flags) => flags,
                    Err(e) => {
                        log::error!("retention failed on {}: {:#}", label, e);
                        Vec::new()
                    }
                }
            };
            controls
                .flags_raised
                .fetch_add(flagged.len() as u64, Ordering::Relaxed);

            let event = FrameEvent {
                frame,
                source_name: name.clone(),
                frame_index,
                detections,
                flagged,
            };
            match ctx.channel.try_push(event) {
                Ok(PushOutcome::Queued) => {
                    controls.frames_pushed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(PushOutcome::DroppedOldest) => {
                    controls.frames_pushed.fetch_add(1, Ordering::Relaxed);
                    log::debug!("channel full; dropped oldest frame for {}", label);
                }
                Ok(PushOutcome::DroppedNewest) => {
                    log::debug!("channel full; dropped {}", label);
                }
                Err(e) => log::error!("frame channel unavailable: {:#}", e),
            }

            thread::sleep(pacing);
        }

        controls.sources_completed.fetch_add(1, Ordering::Relaxed);
        log::info!("finished {} ({} frames)", name, source.frames_read());
    }

    if controls.terminate.load(Ordering::SeqCst) {
        log::info!("producer exiting after terminate");
        return;
    }
    if let Err(e) = ctx.processor.ledger().flush() {
        log::warn!("audit log flush on shutdown failed: {:#}", e);
    }
    log::info!("producer exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_is_half_the_frame_interval_with_floor() {
        assert_eq!(pacing_delay(25.0).as_millis(), 20);
        assert!((pacing_delay(10_000.0).as_secs_f64() - 0.001).abs() < 1e-6);
        assert_eq!(pacing_delay(0.0), pacing_delay(DEFAULT_FPS));
    }

    #[test]
    fn config_validation() {
        assert!(PipelineConfig::default().validate().is_ok());
        let bad = PipelineConfig {
            queue_capacity: 0,
            ..PipelineConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = PipelineConfig {
            confidence_threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
