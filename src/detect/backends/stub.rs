use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::frame::{DetectionBox, Frame};

/// Stub backend for demos and tests.
///
/// Emits a fixed set of boxes on every `period`-th call and nothing otherwise.
/// Boxes are clipped to the frame so they remain meaningful for any source size.
pub struct StubBackend {
    boxes: Vec<DetectionBox>,
    period: u64,
    calls: u64,
}

impl StubBackend {
    /// A stub that never detects anything.
    pub fn new() -> Self {
        Self {
            boxes: Vec::new(),
            period: 1,
            calls: 0,
        }
    }

    /// Emit `boxes` on every call.
    pub fn with_boxes(boxes: Vec<DetectionBox>) -> Self {
        Self {
            boxes,
            period: 1,
            calls: 0,
        }
    }

    /// Only emit on every `period`-th call (1 = every call).
    pub fn every(mut self, period: u64) -> Self {
        self.period = period.max(1);
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>> {
        self.calls += 1;
        if self.calls % self.period != 0 {
            return Ok(Vec::new());
        }
        let max_x = frame.width as f32;
        let max_y = frame.height as f32;
        Ok(self
            .boxes
            .iter()
            .map(|b| DetectionBox {
                x1: b.x1.clamp(0.0, max_x),
                y1: b.y1.clamp(0.0, max_y),
                x2: b.x2.clamp(0.0, max_x),
                y2: b.y2.clamp(0.0, max_y),
                confidence: b.confidence,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_respects_period() -> Result<()> {
        let frame = Frame::synthetic(32, 32, 0)?;
        let mut backend =
            StubBackend::with_boxes(vec![DetectionBox::new(1.0, 1.0, 10.0, 10.0, 0.8)]).every(3);

        assert!(backend.detect(&frame)?.is_empty());
        assert!(backend.detect(&frame)?.is_empty());
        assert_eq!(backend.detect(&frame)?.len(), 1);
        Ok(())
    }

    #[test]
    fn stub_backend_clips_boxes_to_frame() -> Result<()> {
        let frame = Frame::synthetic(16, 8, 0)?;
        let mut backend =
            StubBackend::with_boxes(vec![DetectionBox::new(-4.0, 2.0, 100.0, 100.0, 0.5)]);
        let boxes = backend.detect(&frame)?;
        assert_eq!(boxes[0].x1, 0.0);
        assert_eq!(boxes[0].x2, 16.0);
        assert_eq!(boxes[0].y2, 8.0);
        Ok(())
    }
}
